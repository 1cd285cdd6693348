/*
 * Created on Tue Mar 05 2024
 *
 * This file is a part of the htrie index engine
 * htrie is a concurrent, cache-conscious burst hash trie that indexes
 * records stored inside a single memory-mapped region, designed for
 * high read/write concurrency on many CPUs with pointer stability.
 *
 * Copyright (c) 2024, the htrie developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # htrie
//!
//! A concurrent burst hash trie mapping 64-bit hashed keys to records that
//! live inside one contiguous, relocatable memory region (typically a
//! memory-mapped database file). The trie resolves keys four bits at a
//! time into leaf buckets with lock-free slot claim; overflowing buckets
//! burst into new index levels; readers run without locks under a per-CPU
//! generation guard and writers reclaim memory only after every CPU has
//! moved past the generation of the unlink.
//!
//! ```no_run
//! use htrie::{Flags, Htrie};
//!
//! # fn demo(base: *mut u8) -> htrie::TrieResult<()> {
//! let trie: Htrie = unsafe { Htrie::init(base, 1 << 24, 4, 0, Flags::NONE) }?;
//! let ins = trie.insert(0x1122334455667788, b"ABCDEFGH")?;
//! if let Some(guard) = trie.lookup(0x1122334455667788) {
//!     for rec in guard.matches(0x1122334455667788) {
//!         assert_eq!(rec.bytes(), b"ABCDEFGH");
//!     }
//! }
//! trie.extend(ins.rec, 512)?;
//! # Ok(()) }
//! ```

#![deny(unused_imports, unused_must_use)]

mod alloc;
mod error;
mod mem;
mod sync;
mod trie;

pub use {
    error::{TrieError, TrieResult},
    trie::{
        iter::{Chunks, Matches, RecView, VRecRef},
        meta::{Config, DefConfig, Flags},
        BucketGuard, Htrie, Inserted, RecRef, CPUS_MAX,
    },
};
