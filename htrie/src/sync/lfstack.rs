/*
 * Created on Wed Mar 06 2024
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
    # Offset-based lock-free stack

    A Treiber stack that lives entirely inside the mapped region, so it
    survives remapping at a different address: the head and the links are
    offsets in MINDREC units, not pointers. The head word packs a 32-bit
    ABA counter with the 32-bit offset of the top entry; every successful
    CAS bumps the counter, so a pop that raced with a pop+push of the same
    entry cannot succeed with a stale next link.

    Entries overlay the first four bytes of whatever chunk is being kept on
    the free list (the chunk is free, its body is dead storage).
*/

use {
    super::atm::{ORD_ACQ, ORD_ACR, ORD_RLX},
    crate::{mem::raw, trie::meta},
    core::sync::atomic::{AtomicU32, AtomicU64},
};

/// A free chunk on the stack. Overlays the head of the chunk itself
#[repr(C)]
pub struct SEntry {
    next: AtomicU32,
}

/// Stack head: `(aba_generation << 32) | mindrec_offset`
#[repr(C)]
pub struct LfStack {
    head: AtomicU64,
}

impl LfStack {
    const OFF_MASK: u64 = 0xFFFF_FFFF;

    #[allow(unused)]
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    pub fn init(&self) {
        self.head.store(0, ORD_RLX);
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(ORD_ACQ) & Self::OFF_MASK == 0
    }

    /// Push the chunk at MINDREC offset `di`.
    ///
    /// SAFETY: `di` must reference an in-region chunk of at least
    /// `size_of::<SEntry>()` bytes that no other thread is using.
    pub unsafe fn push(&self, base: *mut u8, di: u32) {
        debug_assert!(di != 0);
        let e = raw::aref::<SEntry>(base, meta::di2o(di));
        let mut head = self.head.load(ORD_ACQ);
        loop {
            e.next.store((head & Self::OFF_MASK) as u32, ORD_RLX);
            let new = Self::repack(head, di);
            match self
                .head
                .compare_exchange(head, new, ORD_ACR, ORD_ACQ)
            {
                Ok(_) => return,
                Err(curr) => head = curr,
            }
        }
    }

    /// Pop a chunk, returning its MINDREC offset.
    ///
    /// SAFETY: `base` must be the base of the region this stack lives in.
    pub unsafe fn pop(&self, base: *mut u8) -> Option<u32> {
        let mut head = self.head.load(ORD_ACQ);
        loop {
            let di = (head & Self::OFF_MASK) as u32;
            if di == 0 {
                return None;
            }
            // The entry may be popped and reused under us; the load stays
            // in-region and the ABA counter invalidates a stale link.
            let next = raw::aref::<SEntry>(base, meta::di2o(di))
                .next
                .load(ORD_ACQ);
            let new = Self::repack(head, next);
            match self
                .head
                .compare_exchange(head, new, ORD_ACR, ORD_ACQ)
            {
                Ok(_) => return Some(di),
                Err(curr) => head = curr,
            }
        }
    }

    #[inline(always)]
    fn repack(head: u64, off: u32) -> u64 {
        let gen = (head >> 32).wrapping_add(1);
        (gen << 32) | off as u64
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc, std::thread};

    #[repr(C, align(128))]
    struct Region([u8; 64 * 128]);

    struct Map {
        _r: Box<Region>,
        base: *mut u8,
        st: LfStack,
    }
    unsafe impl Send for Map {}
    unsafe impl Sync for Map {}

    impl Map {
        fn new() -> Self {
            let mut r = Box::new(Region([0; 64 * 128]));
            let base = r.0.as_mut_ptr();
            let st = LfStack::new();
            st.init();
            Self { _r: r, base, st }
        }
        fn base(&self) -> *mut u8 {
            self.base
        }
    }

    #[test]
    fn push_pop_order() {
        let m = Map::new();
        unsafe {
            m.st.push(m.base(), 1);
            m.st.push(m.base(), 2);
            m.st.push(m.base(), 3);
            assert_eq!(m.st.pop(m.base()), Some(3));
            assert_eq!(m.st.pop(m.base()), Some(2));
            assert_eq!(m.st.pop(m.base()), Some(1));
            assert_eq!(m.st.pop(m.base()), None);
        }
        assert!(m.st.is_empty());
    }

    #[test]
    fn spam_push_pop() {
        let m = Arc::new(Map::new());
        // chunks 1..=63, four threads cycling pop/push
        unsafe {
            for di in 1..64 {
                m.st.push(m.base(), di);
            }
        }
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        unsafe {
                            if let Some(di) = m.st.pop(m.base()) {
                                m.st.push(m.base(), di);
                            }
                        }
                    }
                })
            })
            .collect();
        threads.into_iter().for_each(|t| t.join().unwrap());
        let mut n = 0;
        while unsafe { m.st.pop(m.base()) }.is_some() {
            n += 1;
        }
        assert_eq!(n, 63);
    }
}
