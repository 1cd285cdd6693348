/*
 * Created on Thu Mar 07 2024
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

/*!
    # Embedded block allocator

    The region past the root node is carved into `BLK_SZ` blocks by a shared
    bump cursor; freed blocks go on a lock-free stack and are handed out
    again before the cursor moves. Objects smaller than a block are carved
    out of a per-CPU current block through a write-combining cursor (`wcl`):
    the owning CPU bumps it with plain stores, so allocation on the fast
    path is two loads and a store. When the tail of the current block cannot
    fit a request the cursor jumps to a fresh block and the tail is
    abandoned.

    Rollback is supported for the most recent carve on the same cursor only,
    which is exactly how the insert error paths use it.
*/

use {
    crate::{
        error::{TrieError, TrieResult},
        mem::raw,
        sync::{
            atm::{ORD_ACQ, ORD_ACR, ORD_RLX},
            lfstack::LfStack,
        },
        trie::meta,
    },
    core::sync::atomic::AtomicU64,
};

/// Shared allocator state, embedded in the database header
#[repr(C)]
pub struct BlkAlloc {
    /// next never-allocated block (byte offset)
    cursor: AtomicU64,
    /// end of the usable region (byte offset)
    limit: AtomicU64,
    /// freed blocks
    free: LfStack,
}

impl BlkAlloc {
    pub fn init(&self, first_blk: u64, limit: u64) {
        debug_assert_eq!(first_blk % meta::BLK_SZ as u64, 0);
        self.cursor.store(first_blk, ORD_RLX);
        self.limit.store(limit, ORD_RLX);
        self.free.init();
    }

    /// Allocate one `BLK_SZ` block; the byte offset is block-aligned
    pub fn alloc_blk(&self, base: *mut u8) -> TrieResult<u64> {
        if let Some(di) = unsafe { self.free.pop(base) } {
            return Ok(meta::di2o(di));
        }
        let mut cur = self.cursor.load(ORD_ACQ);
        loop {
            if cur + meta::BLK_SZ as u64 > self.limit.load(ORD_RLX) {
                return Err(TrieError::OutOfMemory);
            }
            match self.cursor.compare_exchange(
                cur,
                cur + meta::BLK_SZ as u64,
                ORD_ACR,
                ORD_ACQ,
            ) {
                Ok(_) => return Ok(cur),
                Err(c) => cur = c,
            }
        }
    }

    pub fn free_blk(&self, base: *mut u8, off: u64) {
        debug_assert_eq!(off % meta::BLK_SZ as u64, 0);
        unsafe { self.free.push(base, meta::o2di(off)) }
    }

    /// End of the usable region this allocator was formatted for
    pub fn limit(&self) -> u64 {
        self.limit.load(ORD_RLX)
    }
}

/// Carve `size` bytes (aligned to `align`) out of the block under the
/// per-CPU cursor `wcl`, taking a fresh block when the tail cannot fit the
/// request. Only the owning CPU may touch `wcl`.
pub fn wcl_take(
    a: &BlkAlloc,
    base: *mut u8,
    wcl: &AtomicU64,
    size: u64,
    align: u64,
) -> TrieResult<u64> {
    debug_assert!(size > 0 && size <= meta::BLK_SZ as u64);
    let cur = wcl.load(ORD_RLX);
    if cur != 0 {
        let o = (cur + align - 1) & !(align - 1);
        // end of the block containing the last carved byte; the cursor is
        // never left exactly at a block start
        let end = ((cur - 1) / meta::BLK_SZ as u64 + 1) * meta::BLK_SZ as u64;
        if o + size <= end {
            wcl.store(o + size, ORD_RLX);
            return Ok(o);
        }
    }
    let blk = a.alloc_blk(base)?;
    wcl.store(blk + size, ORD_RLX);
    Ok(blk)
}

/// Undo the latest `wcl_take` of `size` bytes on this cursor
pub fn wcl_rollback(wcl: &AtomicU64, size: u64) {
    let cur = wcl.load(ORD_RLX);
    debug_assert!(cur >= size);
    wcl.store(cur - size, ORD_RLX);
}

/// Fixed-size object carve: alignment equals the offset base the object is
/// referenced in (cache line for index nodes, MINDREC for buckets)
pub fn alloc_fix(
    a: &BlkAlloc,
    base: *mut u8,
    wcl: &AtomicU64,
    size: u64,
    align: u64,
) -> TrieResult<u64> {
    let o = wcl_take(a, base, wcl, size, align)?;
    debug_assert_eq!(o % align, 0);
    Ok(o)
}

/// Zeroing wrapper for metadata objects that must come out clean even when
/// the block was recycled
pub fn alloc_fix_zeroed(
    a: &BlkAlloc,
    base: *mut u8,
    wcl: &AtomicU64,
    size: u64,
    align: u64,
) -> TrieResult<u64> {
    let o = alloc_fix(a, base, wcl, size, align)?;
    unsafe { raw::zero(base, o, size as usize) };
    Ok(o)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::sync::lfstack::LfStack, core::sync::atomic::AtomicU64};

    #[repr(C, align(4096))]
    struct Region([u8; 16 * 4096]);

    fn region() -> (Box<Region>, BlkAlloc, *mut u8) {
        let mut r = Box::new(Region([0; 16 * 4096]));
        let base = r.0.as_mut_ptr();
        let a = BlkAlloc {
            cursor: AtomicU64::new(0),
            limit: AtomicU64::new(0),
            free: LfStack::new(),
        };
        a.init(4096, 16 * 4096);
        (r, a, base)
    }

    #[test]
    fn blocks_bump_and_recycle() {
        let (_r, a, base) = region();
        let b1 = a.alloc_blk(base).unwrap();
        let b2 = a.alloc_blk(base).unwrap();
        assert_eq!(b1, 4096);
        assert_eq!(b2, 8192);
        a.free_blk(base, b1);
        assert_eq!(a.alloc_blk(base).unwrap(), b1);
    }

    #[test]
    fn blocks_exhaust() {
        let (_r, a, base) = region();
        for _ in 0..15 {
            a.alloc_blk(base).unwrap();
        }
        assert_eq!(a.alloc_blk(base), Err(crate::error::TrieError::OutOfMemory));
    }

    #[test]
    fn wcl_carve_align_rollback() {
        let (_r, a, base) = region();
        let wcl = AtomicU64::new(0);
        let o1 = wcl_take(&a, base, &wcl, 64, 64).unwrap();
        let o2 = wcl_take(&a, base, &wcl, 64, 64).unwrap();
        assert_eq!(o1 % 64, 0);
        assert_eq!(o2, o1 + 64);
        wcl_rollback(&wcl, 64);
        assert_eq!(wcl_take(&a, base, &wcl, 64, 64).unwrap(), o2);
        // a carve that cannot fit the tail moves to a fresh block
        let o3 = wcl_take(&a, base, &wcl, 4096, 128).unwrap();
        assert_eq!(o3 % 4096, 0);
        assert_ne!(o3 / 4096, o1 / 4096);
    }
}
