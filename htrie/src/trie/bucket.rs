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

/*
    bucket
    ---
    A bucket is the leaf container of the trie: a 64-bit occupancy bitmap, a
    free-list link, and an embedded slot array. Slot claim is a
    test-and-set on the slot's bit; the slot is then exclusively owned and
    the record inside it is published by the release-ordered store of the
    slot's witness word (the data offset out of line, a live flag inplace),
    written after the key and the payload. A claimed slot whose witness is
    still zero is invisible to scans and to re-homing, in both layouts.

    Buckets are zeroed at (re)init, so a bit observed set in a recycled
    bucket can never expose a previous life's metadata.
*/

use {
    super::meta::{self, Config},
    crate::{
        mem::raw,
        sync::atm::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
    },
    core::sync::atomic::{AtomicU32, AtomicU64},
};

pub const BUCKET_HDR: u64 = 16;

#[repr(C)]
pub struct Bucket {
    /// occupancy bitmap; the publication point for a slot's existence
    col_map: AtomicU64,
    /// next bucket on the per-CPU reclamation queue (MINDREC units)
    next: AtomicU32,
    _pad: u32,
}

/// Slot header shared by both layouts: the hashed key and the publication
/// witness. Out of line the witness is the byte offset of the record;
/// inplace it is a flag and the payload follows the header. Zero means the
/// slot is claimed but not yet written
#[repr(C)]
pub struct RecMeta {
    key: AtomicU64,
    off: AtomicU64,
}

/// Witness value for a published inplace slot
const INPLACE_LIVE: u64 = 1;

/// What it takes to re-home a record during burst and remove
pub enum RecSrc<'a> {
    Meta { key: u64, off: u64 },
    Inplace { key: u64, payload: &'a [u8] },
}

impl<'a> RecSrc<'a> {
    pub fn key(&self) -> u64 {
        match self {
            Self::Meta { key, .. } | Self::Inplace { key, .. } => *key,
        }
    }
}

/// Slot stride for this database shape
#[inline(always)]
pub fn slot_sz(rec_len: u32, inplace: bool) -> u64 {
    let hdr = core::mem::size_of::<RecMeta>() as u64;
    if inplace {
        meta::ralign(hdr + rec_len as u64)
    } else {
        hdr
    }
}

/// Full bucket footprint, padded out to the data granule
#[inline(always)]
pub fn bucket_bytes<C: Config>(rec_len: u32, inplace: bool) -> u64 {
    meta::dalign(BUCKET_HDR + C::SLOTS as u64 * slot_sz(rec_len, inplace))
}

/// Byte offset of slot `slot` of the bucket at `bckt_off`
#[inline(always)]
pub fn rec_off(bckt_off: u64, slot: usize, slot_sz: u64) -> u64 {
    bckt_off + BUCKET_HDR + slot as u64 * slot_sz
}

impl Bucket {
    /// Reset a just-allocated (or re-initialized pre-publication) bucket.
    /// The caller has already zeroed the slot area.
    pub fn init<C: Config>(&self) {
        self.col_map.store(C::HIGH_SET, ORD_RLX);
        self.next.store(0, ORD_RLX);
    }

    #[inline(always)]
    pub fn map(&self) -> u64 {
        self.col_map.load(ORD_ACQ)
    }

    #[inline(always)]
    pub fn slot_occupied<C: Config>(&self, slot: usize) -> bool {
        self.map() & (1 << C::slot2bit(slot)) != 0
    }

    /// Find the highest clear bit and test-and-set it. `None` means the
    /// bucket hit the burst threshold.
    pub fn claim_slot<C: Config>(&self) -> Option<usize> {
        loop {
            let bit = C::fcz(self.col_map.load(ORD_ACQ));
            if C::full(bit) {
                return None;
            }
            if self.col_map.fetch_or(1 << bit, ORD_ACR) & (1 << bit) == 0 {
                return Some(C::bit2slot(bit));
            }
        }
    }

    /// Fresh-bucket shortcut: only the forced high bits plus slot 0
    pub fn seed_slot0<C: Config>(&self) {
        self.col_map
            .store(C::HIGH_SET | 1 << C::slot2bit(0), ORD_RLX);
    }

    /// One step of the burst map replacement. Returns the current map on
    /// mismatch (set bits can only have been added by racing inserters).
    pub fn swap_map(&self, old: u64, new: u64) -> Result<(), u64> {
        self.col_map
            .compare_exchange(old, new, ORD_ACR, ORD_ACQ)
            .map(|_| ())
    }

    /* reclamation queue link */

    pub fn queue_next(&self) -> u32 {
        self.next.load(ORD_RLX)
    }
    pub fn set_queue_next(&self, di: u32) {
        self.next.store(di, ORD_RLX);
    }
}

/* record access (all offsets are byte offsets from the mapping base) */

/// SAFETY for everything below: `off` must reference a slot (or record)
/// inside a live bucket of the mapping, with the layout matching the
/// `inplace`/`rec_len` shape of the database.

#[inline(always)]
pub unsafe fn slot_key(base: *mut u8, off: u64) -> u64 {
    raw::aref::<RecMeta>(base, off).key.load(ORD_RLX)
}

/// Publication witness of a slot: the record offset out of line, the live
/// flag inplace. The acquire pairs with the release in the publishers, so
/// a nonzero witness makes the key and the body visible
#[inline(always)]
pub unsafe fn slot_live(base: *mut u8, off: u64) -> u64 {
    raw::aref::<RecMeta>(base, off).off.load(ORD_ACQ)
}

#[inline(always)]
pub unsafe fn inplace_payload<'a>(base: *mut u8, off: u64, rec_len: u32) -> &'a [u8] {
    raw::bytes(
        base,
        off + core::mem::size_of::<RecMeta>() as u64,
        rec_len as usize,
    )
}

/// Write an out-of-line slot and publish it: key first, offset last with
/// release. The offset doubles as the publication witness
pub unsafe fn publish_meta(base: *mut u8, off: u64, key: u64, data_off: u64) {
    debug_assert!(data_off != 0);
    let m = raw::aref::<RecMeta>(base, off);
    m.key.store(key, ORD_RLX);
    m.off.store(data_off, ORD_REL);
}

/// Write an inplace slot and publish it: payload and key first, the live
/// flag last with release
pub unsafe fn publish_inplace(base: *mut u8, off: u64, key: u64, payload: &[u8]) {
    let m = raw::aref::<RecMeta>(base, off);
    raw::copy_in(base, off + core::mem::size_of::<RecMeta>() as u64, payload);
    m.key.store(key, ORD_RLX);
    m.off.store(INPLACE_LIVE, ORD_REL);
}

/// Snapshot a published record for re-homing. `None` means the slot is
/// claimed by a racing inserter but not yet published, and must be left
/// alone in either layout
pub unsafe fn rec_src<'a>(
    base: *mut u8,
    off: u64,
    rec_len: u32,
    inplace: bool,
) -> Option<RecSrc<'a>> {
    let live = slot_live(base, off);
    if live == 0 {
        return None;
    }
    let key = slot_key(base, off);
    Some(if inplace {
        RecSrc::Inplace {
            key,
            payload: inplace_payload(base, off, rec_len),
        }
    } else {
        RecSrc::Meta { key, off: live }
    })
}

/// Claim a slot in the bucket at `bckt_off` and copy `src` into it. Safe
/// against concurrent claimers, so it serves both exclusive (fresh bucket)
/// and published destinations. `None` means the destination is full.
pub unsafe fn copy_entry<C: Config>(
    base: *mut u8,
    bckt_off: u64,
    slot_sz: u64,
    src: &RecSrc<'_>,
) -> Option<usize> {
    let b = raw::aref::<Bucket>(base, bckt_off);
    let slot = b.claim_slot::<C>()?;
    let off = rec_off(bckt_off, slot, slot_sz);
    match src {
        RecSrc::Meta { key, off: data } => publish_meta(base, off, *key, *data),
        RecSrc::Inplace { key, payload } => publish_inplace(base, off, *key, payload),
    }
    Some(slot)
}

/// Linear scan for `key` starting at slot `*i`; on a hit, `*i` is the slot
/// index of the returned record (bump it before rescanning). Returns the
/// byte offset of the slot.
pub unsafe fn scan_from<C: Config>(
    base: *mut u8,
    bckt_off: u64,
    slot_sz: u64,
    key: u64,
    i: &mut usize,
) -> Option<u64> {
    let b = raw::aref::<Bucket>(base, bckt_off);
    while *i < C::SLOTS {
        let slot = *i;
        if b.slot_occupied::<C>(slot) {
            let off = rec_off(bckt_off, slot, slot_sz);
            if slot_live(base, off) != 0 && slot_key(base, off) == key {
                return Some(off);
            }
        }
        *i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestConfig;
    impl Config for TestConfig {
        const COLL_MAX: u32 = 7;
        const BURST_MIN_BITS: u32 = 2;
    }

    #[repr(C, align(128))]
    struct Region([u8; 1024]);

    #[test]
    fn claim_until_full() {
        let mut r = Region([0; 1024]);
        let base = r.0.as_mut_ptr();
        let b = unsafe { raw::aref::<Bucket>(base, 128) };
        b.init::<TestConfig>();
        // bits 7..=2, slots 0..=5
        for want in 0..TestConfig::SLOTS {
            assert_eq!(b.claim_slot::<TestConfig>(), Some(want));
        }
        assert_eq!(b.claim_slot::<TestConfig>(), None);
        assert_eq!(b.map() & TestConfig::SLOT_MASK, 0b1111_1100);
    }

    #[test]
    fn publish_then_scan() {
        let mut r = Region([0; 1024]);
        let base = r.0.as_mut_ptr();
        let b = unsafe { raw::aref::<Bucket>(base, 128) };
        b.init::<TestConfig>();
        let ssz = slot_sz(0, false);
        let slot = b.claim_slot::<TestConfig>().unwrap();
        unsafe {
            publish_meta(base, rec_off(128, slot, ssz), 0xfeed, 512);
            let mut i = 0;
            let off = scan_from::<TestConfig>(base, 128, ssz, 0xfeed, &mut i).unwrap();
            assert_eq!(slot_live(base, off), 512);
            assert_eq!(i, slot);
            i += 1;
            assert!(scan_from::<TestConfig>(base, 128, ssz, 0xfeed, &mut i).is_none());
        }
    }

    #[test]
    fn unpublished_slot_is_invisible() {
        let mut r = Region([0; 1024]);
        let base = r.0.as_mut_ptr();
        let b = unsafe { raw::aref::<Bucket>(base, 128) };
        b.init::<TestConfig>();
        let ssz = slot_sz(0, false);
        // claimed but not yet written: zero key, zero witness
        let slot = b.claim_slot::<TestConfig>().unwrap();
        let mut i = 0;
        assert!(unsafe { scan_from::<TestConfig>(base, 128, ssz, 0, &mut i) }.is_none());
        // re-homing must leave it alone too
        assert!(unsafe { rec_src(base, rec_off(128, slot, ssz), 0, false) }.is_none());
    }

    #[test]
    fn unpublished_inplace_slot_is_invisible() {
        let mut r = Region([0; 1024]);
        let base = r.0.as_mut_ptr();
        let b = unsafe { raw::aref::<Bucket>(base, 128) };
        b.init::<TestConfig>();
        let ssz = slot_sz(8, true);
        let slot = b.claim_slot::<TestConfig>().unwrap();
        let off = rec_off(128, slot, ssz);
        unsafe {
            // a claimed all-zero inplace slot matches no scan and is not a
            // record yet, even for key zero
            let mut i = 0;
            assert!(scan_from::<TestConfig>(base, 128, ssz, 0, &mut i).is_none());
            assert!(rec_src(base, off, 8, true).is_none());
            publish_inplace(base, off, 0, b"ABCDEFGH");
            let mut i = 0;
            assert!(scan_from::<TestConfig>(base, 128, ssz, 0, &mut i).is_some());
            match rec_src(base, off, 8, true) {
                Some(RecSrc::Inplace { key: 0, payload }) => assert_eq!(payload, b"ABCDEFGH"),
                _ => panic!("published inplace record not seen"),
            }
        }
    }
}
