/*
 * Created on Fri Mar 08 2024
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

use {
    super::meta::{FANOUT, NODE_SZ},
    crate::sync::atm::{ORD_ACQ, ORD_ACR},
    core::{mem, sync::atomic::AtomicU32},
};

/// One trie index node: a cache line of child references. The root is a
/// contiguous run of `1 << (root_bits - 4)` of these, indexed flat through
/// [`slot_at`].
///
/// A slot only ever changes by CAS: nil to a reference, or (on burst) a
/// bucket reference to an index reference. Nodes are never freed.
#[repr(C, align(64))]
pub struct TrieNode {
    shifts: [AtomicU32; FANOUT],
}

const _: () = assert!(mem::size_of::<TrieNode>() == NODE_SZ);

impl TrieNode {
    #[inline(always)]
    pub fn child(&self, i: usize) -> u32 {
        self.shifts[i].load(ORD_ACQ)
    }
}

/// Child slot `slot` of the node run starting at byte offset `node_off`.
/// For the root this indexes flat across the whole oversized node run.
///
/// SAFETY: `node_off` must reference a live node run inside the mapping and
/// `slot` must be inside that run.
#[inline(always)]
pub unsafe fn slot_at<'a>(base: *mut u8, node_off: u64, slot: usize) -> &'a AtomicU32 {
    &*(base.add(node_off as usize + slot * mem::size_of::<AtomicU32>()) as *const AtomicU32)
}

/// Publish `new` in a child slot if it still holds `old`
///
/// SAFETY: see [`slot_at`]
#[inline(always)]
pub unsafe fn cas_slot(base: *mut u8, node_off: u64, slot: usize, old: u32, new: u32) -> bool {
    slot_at(base, node_off, slot)
        .compare_exchange(old, new, ORD_ACR, ORD_ACQ)
        .is_ok()
}
