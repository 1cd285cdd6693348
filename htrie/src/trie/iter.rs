/*
 * Created on Sat Mar 09 2024
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
    # Record views and iteration

    A record handed out by a scan or a walk is one of three shapes: an
    inplace payload inside the bucket slot, a fixed out-of-line payload, or
    the head of a variable-length chunk chain. Views borrow the mapping;
    they stay valid for as long as the guard (or, for write paths, the
    caller's ownership of the record) does.
*/

use {
    super::{meta::VRFREED, BucketGuard, RecRef},
    crate::{
        mem::raw,
        sync::atm::{ORD_ACQ, ORD_ACR, ORD_RLX},
        trie::meta::{self, Config},
    },
    core::{marker::PhantomData, sync::atomic::AtomicU32},
};

pub(crate) const VREC_HDR: u64 = 8;

/// Variable-length record chunk header; the payload follows. Chunks chain
/// forward through `chunk_next` (MINDREC units), grown by CAS on the tail.
#[repr(C)]
pub(crate) struct VRec {
    chunk_next: AtomicU32,
    len: AtomicU32,
}

impl VRec {
    pub(crate) fn format(&self, len: u32) {
        debug_assert_eq!(len & VRFREED, 0);
        self.chunk_next.store(0, ORD_RLX);
        self.len.store(len, ORD_RLX);
    }
    pub(crate) fn next_di(&self) -> u32 {
        self.chunk_next.load(ORD_ACQ)
    }
    pub(crate) fn payload_len(&self) -> u32 {
        self.len.load(ORD_ACQ) & !VRFREED
    }
    pub(crate) fn is_live(&self) -> bool {
        let l = self.len.load(ORD_ACQ);
        l != 0 && l & VRFREED == 0
    }
    pub(crate) fn mark_freed(&self) {
        self.len.fetch_or(VRFREED, ORD_RLX);
    }
    /// Hook a fresh chunk behind this one; fails if another appender won
    pub(crate) fn try_link(&self, di: u32) -> bool {
        self.chunk_next
            .compare_exchange(0, di, ORD_ACR, ORD_ACQ)
            .is_ok()
    }
}

/// Borrowed view of one chunk of a variable-length record
#[derive(Clone, Copy)]
pub struct VRecRef<'a> {
    base: *mut u8,
    off: u64,
    _l: PhantomData<&'a ()>,
}

impl<'a> VRecRef<'a> {
    pub(crate) unsafe fn new(base: *mut u8, off: u64) -> Self {
        Self {
            base,
            off,
            _l: PhantomData,
        }
    }
    fn vrec(&self) -> &'a VRec {
        unsafe { raw::aref(self.base, self.off) }
    }
    /// Payload bytes stored in this chunk
    pub fn len(&self) -> usize {
        self.vrec().payload_len() as usize
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_live(&self) -> bool {
        self.vrec().is_live()
    }
    pub fn data(&self) -> &'a [u8] {
        unsafe { raw::bytes(self.base, self.off + VREC_HDR, self.len()) }
    }
    pub fn next(&self) -> Option<VRecRef<'a>> {
        let di = self.vrec().next_di();
        (di != 0).then(|| unsafe { Self::new(self.base, meta::di2o(di)) })
    }
    /// This chunk and everything chained behind it
    pub fn chunks(&self) -> Chunks<'a> {
        Chunks(Some(*self))
    }
    pub fn total_len(&self) -> usize {
        self.chunks().map(|c| c.len()).sum()
    }
    /// Opaque handle for `extend`
    pub fn rec(&self) -> RecRef {
        RecRef { off: self.off }
    }
}

pub struct Chunks<'a>(Option<VRecRef<'a>>);

impl<'a> Iterator for Chunks<'a> {
    type Item = VRecRef<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.0?;
        self.0 = cur.next();
        Some(cur)
    }
}

/// A record as seen through a scan or walk
pub enum RecView<'a> {
    /// fixed record embedded in the bucket slot
    Inplace(&'a [u8]),
    /// fixed record stored out of line
    Fixed(&'a [u8]),
    /// head of a variable-length chunk chain
    Var(VRecRef<'a>),
}

impl<'a> RecView<'a> {
    /// Body bytes of the record (first chunk only for variable records)
    pub fn bytes(&self) -> &'a [u8] {
        match self {
            Self::Inplace(b) | Self::Fixed(b) => b,
            Self::Var(v) => v.data(),
        }
    }
    pub fn var(&self) -> Option<VRecRef<'a>> {
        match self {
            Self::Var(v) => Some(*v),
            _ => None,
        }
    }
}

/// Iterator over every record with a given key inside one bucket
pub struct Matches<'t, 'g, C: Config> {
    guard: &'g BucketGuard<'t, C>,
    key: u64,
    i: usize,
}

impl<'t, 'g, C: Config> Matches<'t, 'g, C> {
    pub(super) fn new(guard: &'g BucketGuard<'t, C>, key: u64) -> Self {
        Self { guard, key, i: 0 }
    }
}

impl<'t, 'g, C: Config> Iterator for Matches<'t, 'g, C> {
    type Item = RecView<'g>;
    fn next(&mut self) -> Option<Self::Item> {
        let v = self.guard.scan(self.key, &mut self.i)?;
        self.i += 1;
        Some(v)
    }
}
