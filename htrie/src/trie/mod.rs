/*
 * Created on Sun Mar 10 2024
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

pub(crate) mod bucket;
mod gen;
pub mod iter;
pub mod meta;
mod node;
#[cfg(test)]
mod tests;

/*
    burst hash trie
    ---
    The trie resolves a 64-bit hashed key four bits at a time, least
    significant slice first (the hash concentrates its entropy there).
    Leaves are buckets; when a bucket overflows it bursts: a fresh index
    node is CASed over the parent slot and the bucket's records are
    redistributed across child buckets keyed by the next slice. Readers run
    without locks under a generation guard; removed buckets and data chunks
    are only recycled after every CPU has observed a newer generation.

    Everything lives inside one contiguous region addressed by offsets, so
    the region can be remapped anywhere.
*/

use {
    self::{
        bucket::{Bucket, RecSrc},
        gen::ReadSection,
        iter::{Matches, RecView, VRec, VREC_HDR},
        meta::{Config, DefConfig, Flags, BLK_SZ, DBIT, FANOUT, HTRIE_BITS, MAGIC, OMASK},
        node::TrieNode,
    },
    crate::{
        alloc::{self, BlkAlloc},
        error::{TrieError, TrieResult},
        mem::{raw, CachePadded},
        sync::{
            atm::{ORD_ACQ, ORD_ACR, ORD_RLX, ORD_SEQ},
            lfstack::LfStack,
        },
    },
    core::{
        marker::PhantomData,
        mem,
        ops::ControlFlow,
        ptr,
        sync::atomic::{AtomicU32, AtomicU64},
    },
    log::{debug, error, warn},
    std::{
        cell::RefCell,
        collections::HashSet,
        sync::{Arc, Weak},
    },
};

/// Size of the per-CPU state array; also the cap on concurrently
/// registered threads
pub const CPUS_MAX: usize = 128;
/// Freelist heads in the header: fixed records use head 0, variable
/// records use heads 0, 2, 3 and 4 (head 1 is a layout gap)
const DCACHE_N: usize = 5;
/// `PerCpu::flags` bit: the slot is claimed by a live thread
const PCPU_CLAIMED: u32 = 1;

/// Per-CPU state, persisted in the header. Only the generation is read by
/// other CPUs; everything else is owner-only.
#[repr(C)]
pub(crate) struct PerCpu {
    /// observed generation; `u64::MAX` outside a read section
    pub(crate) generation: AtomicU64,
    /// allocator/registration flags
    pub(crate) flags: AtomicU32,
    /// read-section nesting depth
    pub(crate) depth: AtomicU32,
    /// write-combining cursors: index nodes, buckets, data chunks
    pub(crate) i_wcl: AtomicU64,
    pub(crate) b_wcl: AtomicU64,
    pub(crate) d_wcl: AtomicU64,
    /// local free-bucket queue (MINDREC units)
    pub(crate) free_bckt_h: AtomicU32,
    pub(crate) free_bckt_t: AtomicU32,
}

/// Database header at offset zero of the mapping. The root node run
/// follows at the next cache line, the block area at the next block.
#[repr(C, align(128))]
pub(crate) struct TrieHdr {
    magic: u64,
    flags: u32,
    rec_len: u32,
    root_bits: u32,
    _pad: u32,
    pub(crate) generation: AtomicU64,
    alloc: BlkAlloc,
    dcache: [LfStack; DCACHE_N],
    pub(crate) pcpu: [CachePadded<PerCpu>; CPUS_MAX],
}

const _: () = assert!(mem::size_of::<TrieHdr>() % meta::NODE_SZ == 0);

fn root_off() -> u64 {
    meta::ialign(mem::size_of::<TrieHdr>() as u64)
}
fn root_sz(root_bits: u32) -> u64 {
    meta::NODE_SZ as u64 * (1u64 << (root_bits - HTRIE_BITS))
}
fn data_start(root_bits: u32) -> u64 {
    meta::blkalign(root_off() + root_sz(root_bits))
}

/// Handle-shared state: the mapping and the parameters cached off the
/// header at init
struct Shared {
    base: *mut u8,
    size: u64,
    root_bits: u32,
    root_mask: u64,
    rec_len: u32,
    varlen: bool,
    inplace: bool,
    slot_sz: u64,
    bckt_bytes: u64,
    /// diagnostic: burst had to alias two index slots to one bucket
    burst_collision_no_mem: AtomicU64,
}

// The mapping outlives the handle per the `init` contract and all shared
// mutation goes through atomics.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    unsafe fn hdr<'a>(&'a self) -> &'a TrieHdr {
        &*(self.base as *const TrieHdr)
    }
}

/// Handle teardown. The mapping takes a single handle, so every claimed
/// per-CPU slot in the header belongs to a thread of this handle, and no
/// thread can start another operation once the handle is gone: release
/// them all so a later attach gets the full slot array back
impl Drop for Shared {
    fn drop(&mut self) {
        let hdr = unsafe { self.hdr() };
        for p in hdr.pcpu.iter() {
            p.flags.store(0, ORD_SEQ);
        }
    }
}

/// Per-thread CPU-slot registrations; claim bits are dropped when the
/// thread dies (while the handle is still alive) or when the handle dies
struct TlsSlots {
    v: Vec<(Weak<Shared>, u16)>,
}

impl Drop for TlsSlots {
    fn drop(&mut self) {
        for (w, slot) in self.v.drain(..) {
            if let Some(s) = w.upgrade() {
                unsafe { s.hdr() }.pcpu[slot as usize]
                    .flags
                    .store(0, ORD_SEQ);
            }
        }
    }
}

thread_local! {
    static CPU_SLOTS: RefCell<TlsSlots> = RefCell::new(TlsSlots { v: Vec::new() });
}

/// Opaque record handle: the byte offset of the record body (the head
/// chunk for variable records). For inplace databases the handle is only
/// meaningful as a success witness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecRef {
    pub(crate) off: u64,
}

/// Outcome of a successful insert or extend
#[derive(Debug, Clone, Copy)]
pub struct Inserted {
    pub rec: RecRef,
    /// bytes actually stored; smaller than requested when the allocator
    /// granted less
    pub stored: usize,
}

/// Where descend stopped: the node slot it read last and what it held
struct Descent {
    node_off: u64,
    slot: usize,
    bits: u32,
    bref: u32,
}

/// An out-of-line data grant and where it came from, for exact rollback
#[derive(Clone, Copy)]
struct DataChunk {
    off: u64,
    granted: u64,
    cls: Option<usize>,
    cached: bool,
}

enum BcktOrigin {
    Queue,
    Wcl,
}

enum BurstExit {
    /// fan-out increased; restart from descent
    Split,
    /// all entries still map to one child: advance four bits and burst
    /// again against the new node
    Repeat(u64),
}

enum BurstErr {
    Retry,
    NoMem,
}

/// Variable-record size classes: bytes (incl. VRec header) to freelist
/// head and chunk size. Requests above the largest class take whole blocks
fn dclass(total: u64) -> Option<(usize, u64)> {
    if total <= 256 {
        Some((0, 256))
    } else if total <= 512 {
        Some((2, 512))
    } else if total <= 1024 {
        Some((3, 1024))
    } else if total <= 2048 {
        Some((4, 2048))
    } else {
        None
    }
}

/// The index handle. All operations take `&self` and are safe to share
/// across threads; each thread transparently claims one of the `CPUS_MAX`
/// per-CPU slots on first use.
pub struct Htrie<C: Config = DefConfig> {
    shared: Arc<Shared>,
    _c: PhantomData<C>,
}

impl<C: Config> std::fmt::Debug for Htrie<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Htrie").finish()
    }
}

impl<C: Config> Htrie<C> {
    /// Attach to (or format) the database inside `[base, base + db_size)`.
    ///
    /// A region whose header carries the magic is attached as-is after the
    /// parameters are checked against it; anything else is formatted from
    /// scratch. `rec_len == 0` selects variable-length records;
    /// [`Flags::INPLACE`] stores fixed records directly in bucket slots.
    ///
    /// SAFETY: `base` must point to a block-aligned region of at least
    /// `db_size` bytes that stays valid (and is not attached through a
    /// second handle) for the lifetime of the returned handle and every
    /// thread that used it.
    pub unsafe fn init(
        base: *mut u8,
        db_size: usize,
        root_bits: u32,
        rec_len: u32,
        flags: Flags,
    ) -> TrieResult<Self> {
        let _ = C::CHECK;
        let inplace = flags.contains(Flags::INPLACE);
        if base.is_null() || base as usize % BLK_SZ != 0 {
            error!("mapping base {:p} is not block-aligned", base);
            return Err(TrieError::InvalidUsage);
        }
        if db_size as u64 > meta::MAX_SHARD_SZ {
            error!("too large database size ({db_size})");
            return Err(TrieError::InvalidUsage);
        }
        if rec_len as usize > BLK_SZ / 2 {
            error!("too large record length ({rec_len})");
            return Err(TrieError::InvalidUsage);
        }
        if root_bits < HTRIE_BITS || root_bits % HTRIE_BITS != 0 || root_bits > 32 {
            error!("root node bits ({root_bits}) must be a multiple of 4");
            return Err(TrieError::InvalidUsage);
        }
        if flags.raw() & !Flags::INPLACE.raw() != 0 {
            error!("unknown flags ({:#x})", flags.raw());
            return Err(TrieError::InvalidUsage);
        }
        if inplace && rec_len == 0 {
            error!("inplace data is possible for fixed-size records only");
            return Err(TrieError::InvalidUsage);
        }
        if inplace && bucket::bucket_bytes::<C>(rec_len, true) > BLK_SZ as u64 {
            error!("inplace record of {rec_len} bytes makes the bucket larger than a block");
            return Err(TrieError::InvalidUsage);
        }
        if (db_size as u64) < data_start(root_bits) + BLK_SZ as u64 {
            error!("database size ({db_size}) cannot fit the header and root");
            return Err(TrieError::InvalidUsage);
        }

        let h = base as *mut TrieHdr;
        if (*h).magic == MAGIC {
            // live database: trust the persisted allocator state, reset
            // the runtime per-CPU fields
            let hdr = &*h;
            if hdr.rec_len != rec_len || hdr.root_bits != root_bits || hdr.flags != flags.raw() {
                error!(
                    "database shape mismatch: stored (rec_len {}, root_bits {}, flags {:#x})",
                    hdr.rec_len, hdr.root_bits, hdr.flags
                );
                return Err(TrieError::InvalidUsage);
            }
            if hdr.alloc.limit() != db_size as u64 {
                error!(
                    "database size mismatch: stored {}, mapped {db_size}",
                    hdr.alloc.limit()
                );
                return Err(TrieError::InvalidUsage);
            }
            for p in hdr.pcpu.iter() {
                p.generation.store(u64::MAX, ORD_RLX);
                p.depth.store(0, ORD_RLX);
                p.flags.store(0, ORD_RLX);
            }
            debug!(
                "attached to existing database, generation {}",
                hdr.generation.load(ORD_RLX)
            );
        } else {
            raw::zero(base, 0, data_start(root_bits) as usize);
            ptr::addr_of_mut!((*h).flags).write(flags.raw());
            ptr::addr_of_mut!((*h).rec_len).write(rec_len);
            ptr::addr_of_mut!((*h).root_bits).write(root_bits);
            {
                let hdr = &*h;
                hdr.generation.store(0, ORD_RLX);
                hdr.alloc.init(data_start(root_bits), db_size as u64);
                for dc in hdr.dcache.iter() {
                    dc.init();
                }
                for p in hdr.pcpu.iter() {
                    p.generation.store(u64::MAX, ORD_RLX);
                }
            }
            ptr::addr_of_mut!((*h).magic).write(MAGIC);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                base,
                size: db_size as u64,
                root_bits,
                root_mask: (1u64 << root_bits) - 1,
                rec_len,
                varlen: rec_len == 0,
                inplace,
                slot_sz: bucket::slot_sz(rec_len, inplace),
                bckt_bytes: bucket::bucket_bytes::<C>(rec_len, inplace),
                burst_collision_no_mem: AtomicU64::new(0),
            }),
            _c: PhantomData,
        })
    }

    /* handle-level accessors */

    #[inline(always)]
    fn base(&self) -> *mut u8 {
        self.shared.base
    }
    #[inline(always)]
    fn hdr(&self) -> &TrieHdr {
        unsafe { self.shared.hdr() }
    }
    #[inline(always)]
    fn cpu(&self, i: u16) -> &PerCpu {
        &self.hdr().pcpu[i as usize]
    }
    /// How many times a burst had to alias two index slots to the same
    /// bucket because a sibling bucket could not be allocated
    pub fn burst_collisions(&self) -> u64 {
        self.shared.burst_collision_no_mem.load(ORD_RLX)
    }

    /// The per-CPU slot of the calling thread, claimed on first use
    fn this_cpu(&self) -> TrieResult<u16> {
        CPU_SLOTS.with(|c| {
            let mut reg = c.borrow_mut();
            let mut found = None;
            reg.v.retain(|(w, s)| match w.upgrade() {
                Some(sh) => {
                    if Arc::ptr_eq(&sh, &self.shared) {
                        found = Some(*s);
                    }
                    true
                }
                None => false,
            });
            if let Some(s) = found {
                return Ok(s);
            }
            let hdr = self.hdr();
            for i in 0..CPUS_MAX {
                if hdr.pcpu[i]
                    .flags
                    .compare_exchange(0, PCPU_CLAIMED, ORD_ACR, ORD_RLX)
                    .is_ok()
                {
                    reg.v.push((Arc::downgrade(&self.shared), i as u16));
                    return Ok(i as u16);
                }
            }
            error!("all {CPUS_MAX} per-cpu slots are claimed by live threads");
            Err(TrieError::OutOfMemory)
        })
    }

    /* allocation facade */

    fn alloc_index(&self, cpu: &PerCpu) -> TrieResult<u64> {
        alloc::alloc_fix_zeroed(
            &self.hdr().alloc,
            self.base(),
            &cpu.i_wcl,
            meta::NODE_SZ as u64,
            meta::NODE_SZ as u64,
        )
    }

    fn rollback_index(&self, cpu: &PerCpu) {
        alloc::wcl_rollback(&cpu.i_wcl, meta::NODE_SZ as u64);
    }

    fn init_bucket(&self, off: u64) {
        unsafe {
            raw::zero(self.base(), off, self.shared.bckt_bytes as usize);
            raw::aref::<Bucket>(self.base(), off).init::<C>();
        }
    }

    /// Recycle from the local free-bucket queue first, then carve a new
    /// bucket. The bucket comes back zeroed and initialized
    fn alloc_bucket(&self, cpu: &PerCpu) -> TrieResult<(u64, BcktOrigin)> {
        let h = cpu.free_bckt_h.load(ORD_RLX);
        let (off, origin) = if h != 0 {
            let off = meta::di2o(h);
            let next = unsafe { raw::aref::<Bucket>(self.base(), off) }.queue_next();
            cpu.free_bckt_h.store(next, ORD_RLX);
            if next == 0 {
                cpu.free_bckt_t.store(0, ORD_RLX);
            }
            (off, BcktOrigin::Queue)
        } else {
            let off = alloc::alloc_fix(
                &self.hdr().alloc,
                self.base(),
                &cpu.b_wcl,
                self.shared.bckt_bytes,
                meta::MINDREC as u64,
            )?;
            (off, BcktOrigin::Wcl)
        };
        self.init_bucket(off);
        Ok((off, origin))
    }

    fn rollback_bucket(&self, cpu: &PerCpu, off: u64, origin: BcktOrigin) {
        match origin {
            BcktOrigin::Wcl => alloc::wcl_rollback(&cpu.b_wcl, self.shared.bckt_bytes),
            BcktOrigin::Queue => self.queue_bucket(cpu, off),
        }
    }

    /// Append a bucket nobody can reach anymore to the local reclamation
    /// queue
    fn queue_bucket(&self, cpu: &PerCpu, off: u64) {
        let di = meta::o2di(off);
        unsafe { raw::aref::<Bucket>(self.base(), off) }.set_queue_next(0);
        let t = cpu.free_bckt_t.load(ORD_RLX);
        if t != 0 {
            unsafe { raw::aref::<Bucket>(self.base(), meta::di2o(t)) }.set_queue_next(di);
        } else {
            cpu.free_bckt_h.store(di, ORD_RLX);
        }
        cpu.free_bckt_t.store(di, ORD_RLX);
    }

    /// Out-of-line data grant. Variable-length grants are rounded up to
    /// their size class so freelist reuse is exact; `*len` shrinks only
    /// when even a whole block cannot hold the request
    fn alloc_data(&self, cpu: &PerCpu, len: &mut usize) -> TrieResult<DataChunk> {
        let hdr = self.hdr();
        let base = self.base();
        if self.shared.varlen {
            if *len + VREC_HDR as usize > BLK_SZ {
                *len = BLK_SZ - VREC_HDR as usize;
            }
            let total = *len as u64 + VREC_HDR;
            match dclass(total) {
                Some((cls, csz)) => {
                    if !hdr.dcache[cls].is_empty() {
                        if let Some(di) = unsafe { hdr.dcache[cls].pop(base) } {
                            return Ok(DataChunk {
                                off: meta::di2o(di),
                                granted: csz,
                                cls: Some(cls),
                                cached: true,
                            });
                        }
                    }
                    let off = alloc::wcl_take(
                        &hdr.alloc,
                        base,
                        &cpu.d_wcl,
                        csz,
                        meta::MINDREC as u64,
                    )?;
                    Ok(DataChunk {
                        off,
                        granted: csz,
                        cls: Some(cls),
                        cached: false,
                    })
                }
                None => {
                    let off = hdr.alloc.alloc_blk(base)?;
                    Ok(DataChunk {
                        off,
                        granted: BLK_SZ as u64,
                        cls: None,
                        cached: false,
                    })
                }
            }
        } else {
            let csz = meta::dalign(self.shared.rec_len as u64);
            if !hdr.dcache[0].is_empty() {
                if let Some(di) = unsafe { hdr.dcache[0].pop(base) } {
                    return Ok(DataChunk {
                        off: meta::di2o(di),
                        granted: csz,
                        cls: Some(0),
                        cached: true,
                    });
                }
            }
            let off =
                alloc::wcl_take(&hdr.alloc, base, &cpu.d_wcl, csz, meta::MINDREC as u64)?;
            Ok(DataChunk {
                off,
                granted: csz,
                cls: Some(0),
                cached: false,
            })
        }
    }

    /// Exact undo of [`alloc_data`]: freelist grants go back to their
    /// freelist, cursor grants rewind the cursor, blocks go back whole
    fn rollback_data(&self, cpu: &PerCpu, c: &DataChunk) {
        match (c.cls, c.cached) {
            (Some(cls), true) => unsafe {
                self.hdr().dcache[cls].push(self.base(), meta::o2di(c.off))
            },
            (Some(_), false) => alloc::wcl_rollback(&cpu.d_wcl, c.granted),
            (None, _) => self.hdr().alloc.free_blk(self.base(), c.off),
        }
    }

    /// Return a record chunk of `total` bytes (header included) to its
    /// size class, or the whole block to the block allocator
    fn free_data(&self, off: u64, total: u64) {
        let hdr = self.hdr();
        if self.shared.varlen {
            match dclass(total) {
                Some((cls, _)) => unsafe { hdr.dcache[cls].push(self.base(), meta::o2di(off)) },
                None => {
                    debug_assert_eq!(off % BLK_SZ as u64, 0);
                    hdr.alloc.free_blk(self.base(), off);
                }
            }
        } else {
            unsafe { hdr.dcache[0].push(self.base(), meta::o2di(off)) }
        }
    }

    /// Format the out-of-line record body at `off`
    unsafe fn create_rec(&self, off: u64, data: &[u8], len: usize) {
        if self.shared.varlen {
            raw::aref::<VRec>(self.base(), off).format(len as u32);
            raw::copy_in(self.base(), off + VREC_HDR, &data[..len]);
        } else {
            raw::copy_in(self.base(), off, &data[..len]);
        }
    }

    /* traversal */

    /// Walk the trie by successive key slices. Returns the last node slot
    /// read and the reference it held: `bref == 0` means the key is
    /// absent, otherwise `bref` is a bucket reference
    fn descend(&self, key: u64) -> Descent {
        let base = self.base();
        let mut bits = 0u32;
        let mut node_off = root_off();
        let mut slot = (key & self.shared.root_mask) as usize;
        let mut o = unsafe { node::slot_at(base, node_off, slot) }.load(ORD_ACQ);
        loop {
            if o == 0 {
                return Descent {
                    node_off,
                    slot,
                    bits,
                    bref: 0,
                };
            }
            bits += HTRIE_BITS;
            if o & DBIT != 0 {
                debug_assert!(meta::di2o(o & OMASK) < self.shared.size);
                return Descent {
                    node_off,
                    slot,
                    bits,
                    bref: o,
                };
            }
            node_off = meta::ii2o(o);
            debug_assert!(node_off < self.shared.size);
            debug_assert!(!meta::resolved(bits));
            slot = meta::idx(key, bits);
            o = unsafe { node::slot_at(base, node_off, slot) }.load(ORD_ACQ);
        }
    }

    /* insert */

    /// Insert a record; duplicate keys are allowed. On success reports the
    /// number of bytes stored, which may be less than `data.len()` for a
    /// large variable-length record (grow the rest with [`Self::extend`])
    pub fn insert(&self, key: u64, data: &[u8]) -> TrieResult<Inserted> {
        if data.is_empty() {
            return Err(TrieError::InvalidUsage);
        }
        if self.shared.rec_len != 0 && data.len() != self.shared.rec_len as usize {
            return Err(TrieError::InvalidUsage);
        }
        let cpu = self.cpu(self.this_cpu()?);
        let _rs = ReadSection::enter(self.hdr(), cpu);

        let mut stored = data.len();
        let chunk = if !self.shared.inplace {
            let c = self.alloc_data(cpu, &mut stored)?;
            unsafe { self.create_rec(c.off, data, stored) };
            Some(c)
        } else {
            None
        };
        let data_off = chunk.map(|c| c.off).unwrap_or(0);
        let base = self.base();
        let ssz = self.shared.slot_sz;

        'restart: loop {
            let d = self.descend(key);
            if d.bref == 0 {
                // no bucket yet: hang a fresh one off the empty slot
                let (boff, origin) = match self.alloc_bucket(cpu) {
                    Ok(v) => v,
                    Err(e) => {
                        self.rollback_chunk(cpu, &chunk);
                        return Err(e);
                    }
                };
                let roff = bucket::rec_off(boff, 0, ssz);
                unsafe {
                    if self.shared.inplace {
                        bucket::publish_inplace(base, roff, key, data);
                    } else {
                        bucket::publish_meta(base, roff, key, data_off);
                    }
                    raw::aref::<Bucket>(base, boff).seed_slot0::<C>();
                }
                let bref = meta::o2di(boff) | DBIT;
                if unsafe { node::cas_slot(base, d.node_off, d.slot, 0, bref) } {
                    return Ok(self.inserted(roff, data_off, stored));
                }
                // another writer built this branch first
                self.rollback_bucket(cpu, boff, origin);
                continue 'restart;
            }

            let boff = meta::di2o(d.bref & OMASK);
            let b = unsafe { raw::aref::<Bucket>(base, boff) };
            if let Some(slot) = b.claim_slot::<C>() {
                let roff = bucket::rec_off(boff, slot, ssz);
                unsafe {
                    if self.shared.inplace {
                        bucket::publish_inplace(base, roff, key, data);
                    } else {
                        bucket::publish_meta(base, roff, key, data_off);
                    }
                }
                return Ok(self.inserted(roff, data_off, stored));
            }

            // the bucket is full: burst until the fan-out grows
            let mut bits = d.bits;
            let mut node_off = d.node_off;
            let mut slot = d.slot;
            let bref = d.bref;
            loop {
                if meta::resolved(bits) {
                    error!(
                        "all bits of key {key:#x} resolved and the collision bucket is full, \
                         no space to insert"
                    );
                    self.rollback_chunk(cpu, &chunk);
                    return Err(TrieError::NoSpace);
                }
                match self.burst(cpu, boff, bref, bits, node_off, slot) {
                    Ok(BurstExit::Split) => continue 'restart,
                    Ok(BurstExit::Repeat(ioff)) => {
                        slot = meta::idx(key, bits);
                        node_off = ioff;
                        bits += HTRIE_BITS;
                    }
                    Err(BurstErr::Retry) => continue 'restart,
                    Err(BurstErr::NoMem) => {
                        self.rollback_chunk(cpu, &chunk);
                        return Err(TrieError::OutOfMemory);
                    }
                }
            }
        }
    }

    fn inserted(&self, slot_off: u64, data_off: u64, stored: usize) -> Inserted {
        Inserted {
            rec: RecRef {
                off: if self.shared.inplace {
                    slot_off
                } else {
                    data_off
                },
            },
            stored,
        }
    }

    fn rollback_chunk(&self, cpu: &PerCpu, chunk: &Option<DataChunk>) {
        if let Some(c) = chunk {
            self.rollback_data(cpu, c);
        }
    }

    /* burst */

    /// Replace the parent slot referencing the full bucket with a new
    /// index node demultiplexing on the slice at `bits`, redistributing
    /// the bucket's records across child buckets
    fn burst(
        &self,
        cpu: &PerCpu,
        boff: u64,
        bref: u32,
        bits: u32,
        pnode_off: u64,
        pslot: usize,
    ) -> Result<BurstExit, BurstErr> {
        let base = self.base();
        let ioff = self.alloc_index(cpu).map_err(|_| BurstErr::NoMem)?;
        let b = unsafe { raw::aref::<Bucket>(base, boff) };

        let mut map = b.map();
        let mut new_map: u64 = C::HIGH_SET;
        if self
            .move_records(cpu, boff, bref, map & C::SLOT_MASK, bits, ioff, &mut new_map, false)
            .is_err()
        {
            self.burst_cleanup(cpu, ioff, bref);
            return Err(BurstErr::NoMem);
        }

        if !unsafe { node::cas_slot(base, pnode_off, pslot, bref, meta::o2ii(ioff)) } {
            self.burst_cleanup(cpu, ioff, bref);
            return Err(BurstErr::Retry);
        }

        // Until the map swap lands, the old bucket and the new children
        // double-reference some records; readers see a superset. Racing
        // inserters can only add bits, so redo the delta and retry
        loop {
            match b.swap_map(map, new_map) {
                Ok(()) => break,
                Err(curr) => {
                    let added = (curr ^ map) & C::SLOT_MASK;
                    let _ = self.move_records(
                        cpu, boff, bref, added, bits, ioff, &mut new_map, true,
                    );
                    map = curr;
                }
            }
        }

        if new_map & C::SLOT_MASK == map & C::SLOT_MASK {
            Ok(BurstExit::Repeat(ioff))
        } else {
            Ok(BurstExit::Split)
        }
    }

    /// Re-home every record of `todo` (a set of slot bits of the source
    /// bucket) under the node at `inode_off`. Bits of records that stay in
    /// the source bucket are accumulated into `new_map`. With `no_alloc`
    /// the pass must not fail: a missing sibling bucket degrades to
    /// aliasing the source bucket from the index slot
    #[allow(clippy::too_many_arguments)]
    fn move_records(
        &self,
        cpu: &PerCpu,
        src_boff: u64,
        src_bref: u32,
        todo: u64,
        bits: u32,
        inode_off: u64,
        new_map: &mut u64,
        no_alloc: bool,
    ) -> TrieResult<()> {
        let base = self.base();
        let ssz = self.shared.slot_sz;
        for s in 0..C::SLOTS {
            let bit = 1u64 << C::slot2bit(s);
            if todo & bit == 0 {
                continue;
            }
            let roff = bucket::rec_off(src_boff, s, ssz);
            let src = match unsafe {
                bucket::rec_src(base, roff, self.shared.rec_len, self.shared.inplace)
            } {
                Some(src) => src,
                None => {
                    // claimed by a racing inserter, not yet published
                    *new_map |= bit;
                    continue;
                }
            };
            let mut pnode = inode_off;
            let mut pbits = bits;
            'place: loop {
                let i = meta::idx(src.key(), pbits);
                let islot = unsafe { node::slot_at(base, pnode, i) };
                let cur = islot.load(ORD_ACQ);
                if cur == 0 {
                    if *new_map & C::SLOT_MASK == 0 && pnode == inode_off {
                        // the first record stays in the source bucket
                        if islot
                            .compare_exchange(0, src_bref, ORD_ACR, ORD_ACQ)
                            .is_ok()
                        {
                            *new_map |= bit;
                            break 'place;
                        }
                        continue 'place;
                    }
                    match self.alloc_bucket(cpu) {
                        Ok((nb, origin)) => {
                            let copied = unsafe { bucket::copy_entry::<C>(base, nb, ssz, &src) };
                            debug_assert!(copied.is_some());
                            let nref = meta::o2di(nb) | DBIT;
                            if islot.compare_exchange(0, nref, ORD_ACR, ORD_ACQ).is_ok() {
                                break 'place;
                            }
                            self.rollback_bucket(cpu, nb, origin);
                            continue 'place;
                        }
                        Err(e) if !no_alloc => return Err(e),
                        Err(_) => {
                            // keep the record where it is and point the
                            // index slot at the source bucket too
                            if islot
                                .compare_exchange(0, src_bref, ORD_ACR, ORD_ACQ)
                                .is_ok()
                            {
                                *new_map |= bit;
                                self.shared.burst_collision_no_mem.fetch_add(1, ORD_RLX);
                                break 'place;
                            }
                            continue 'place;
                        }
                    }
                }
                if cur & DBIT == 0 {
                    // the child already burst into its own index level
                    pnode = meta::ii2o(cur);
                    pbits += HTRIE_BITS;
                    if meta::resolved(pbits) {
                        *new_map |= bit;
                        break 'place;
                    }
                    continue 'place;
                }
                if cur == src_bref {
                    *new_map |= bit;
                    break 'place;
                }
                let dst = meta::di2o(cur & OMASK);
                if unsafe { bucket::copy_entry::<C>(base, dst, ssz, &src) }.is_none() {
                    // destination filled up under us
                    *new_map |= bit;
                    self.shared.burst_collision_no_mem.fetch_add(1, ORD_RLX);
                    warn!(
                        "burst: destination bucket full, record for key {:#x} stays co-located",
                        src.key()
                    );
                }
                break 'place;
            }
        }
        Ok(())
    }

    /// Free everything a failed burst allocated. Nothing here was ever
    /// published
    fn burst_cleanup(&self, cpu: &PerCpu, inode_off: u64, src_bref: u32) {
        let inode = unsafe { raw::aref::<TrieNode>(self.base(), inode_off) };
        for i in 0..FANOUT {
            let cur = inode.child(i);
            if cur != 0 && cur != src_bref {
                debug_assert!(cur & DBIT != 0);
                self.queue_bucket(cpu, meta::di2o(cur & OMASK));
            }
        }
        self.rollback_index(cpu);
    }

    /* remove */

    /// Delete every record with key `key` by swapping the terminal bucket
    /// for a filtered copy, then reclaim the old bucket and data after a
    /// generation synchronize
    pub fn remove(&self, key: u64) -> TrieResult<()> {
        let cpu = self.cpu(self.this_cpu()?);
        let (nboff, norigin) = self.alloc_bucket(cpu)?;
        let base = self.base();
        let ssz = self.shared.slot_sz;
        let mut reclaim: Vec<u64> = Vec::with_capacity(C::SLOTS);

        let old_boff = {
            let _rs = ReadSection::enter(self.hdr(), cpu);
            loop {
                let d = self.descend(key);
                if d.bref == 0 {
                    self.rollback_bucket(cpu, nboff, norigin);
                    return Ok(());
                }
                let boff = meta::di2o(d.bref & OMASK);
                let b = unsafe { raw::aref::<Bucket>(base, boff) };
                // Inserters rely on records never moving and map bits never
                // clearing inside a live bucket, so filter into a copy
                let map = b.map() & C::SLOT_MASK;
                reclaim.clear();
                for s in 0..C::SLOTS {
                    if map & (1 << C::slot2bit(s)) == 0 {
                        continue;
                    }
                    let roff = bucket::rec_off(boff, s, ssz);
                    let src = match unsafe {
                        bucket::rec_src(base, roff, self.shared.rec_len, self.shared.inplace)
                    } {
                        Some(src) => src,
                        // mid-publication in either layout, leave it alone
                        None => continue,
                    };
                    if src.key() != key {
                        let copied = unsafe { bucket::copy_entry::<C>(base, nboff, ssz, &src) };
                        debug_assert!(copied.is_some());
                    } else if let RecSrc::Meta { off, .. } = src {
                        reclaim.push(off);
                    }
                }
                if unsafe {
                    node::cas_slot(base, d.node_off, d.slot, d.bref, meta::o2di(nboff) | DBIT)
                } {
                    break boff;
                }
                // lost the race; refilter from scratch
                self.init_bucket(nboff);
            }
        };

        // every reader that could still see the old bucket is gone after
        // this returns
        gen::synchronize(self.hdr());

        self.queue_bucket(cpu, old_boff);
        if self.shared.inplace {
            return Ok(());
        }
        for off in reclaim {
            if self.shared.varlen {
                let mut o = off;
                loop {
                    let vr = unsafe { raw::aref::<VRec>(base, o) };
                    let next = vr.next_di();
                    let total = vr.payload_len() as u64 + VREC_HDR;
                    vr.mark_freed();
                    self.free_data(o, total);
                    if next == 0 {
                        break;
                    }
                    o = meta::di2o(next);
                }
            } else {
                self.free_data(off, meta::dalign(self.shared.rec_len as u64));
            }
        }
        Ok(())
    }

    /* lookup & iteration */

    /// Find the bucket holding records for `key`. The guard keeps the
    /// reclamation generation pinned; drop it as soon as the records have
    /// been read
    pub fn lookup(&self, key: u64) -> Option<BucketGuard<'_, C>> {
        let cpu_i = self.this_cpu().ok()?;
        let cpu = self.cpu(cpu_i);
        gen::enter(self.hdr(), cpu);
        let d = self.descend(key);
        if d.bref == 0 {
            gen::exit(cpu);
            return None;
        }
        Some(BucketGuard {
            trie: self,
            cpu: cpu_i,
            boff: meta::di2o(d.bref & OMASK),
            _local: PhantomData,
        })
    }

    /// Scan the guarded bucket for `key` starting at slot `*i`; `*i` is
    /// left at the matching slot, bump it before the next call
    pub fn bucket_scan<'g>(
        &self,
        b: &'g BucketGuard<'_, C>,
        key: u64,
        i: &mut usize,
    ) -> Option<RecView<'g>> {
        let off = unsafe {
            bucket::scan_from::<C>(self.base(), b.boff, self.shared.slot_sz, key, i)
        }?;
        Some(unsafe { self.view_of_slot(off) })
    }

    unsafe fn view_of_slot<'a>(&self, slot_off: u64) -> RecView<'a> {
        let base = self.base();
        if self.shared.inplace {
            RecView::Inplace(bucket::inplace_payload(base, slot_off, self.shared.rec_len))
        } else {
            let off = bucket::slot_live(base, slot_off);
            if self.shared.varlen {
                RecView::Var(iter::VRecRef::new(base, off))
            } else {
                RecView::Fixed(raw::bytes(base, off, self.shared.rec_len as usize))
            }
        }
    }

    /* extend */

    /// Append `size` more bytes of capacity to a variable-length record by
    /// chaining a fresh chunk to its tail. The caller is expected to be
    /// the only appender, though racing appenders are tolerated
    pub fn extend(&self, rec: RecRef, size: usize) -> TrieResult<Inserted> {
        if !self.shared.varlen || size == 0 {
            return Err(TrieError::InvalidUsage);
        }
        let cpu = self.cpu(self.this_cpu()?);
        let mut stored = size;
        let chunk = self.alloc_data(cpu, &mut stored)?;
        unsafe { raw::aref::<VRec>(self.base(), chunk.off) }.format(stored as u32);
        let ndi = meta::o2di(chunk.off);

        let mut tail = rec.off;
        loop {
            let vr = unsafe { raw::aref::<VRec>(self.base(), tail) };
            let next = vr.next_di();
            if next != 0 {
                tail = meta::di2o(next);
                continue;
            }
            if vr.try_link(ndi) {
                break;
            }
        }
        Ok(Inserted {
            rec: RecRef { off: chunk.off },
            stored,
        })
    }

    /* walk */

    /// Depth-first, left-to-right traversal over every live record.
    /// `ControlFlow::Break` from the callback aborts the walk. Buckets
    /// aliased under more than one index slot are visited once
    pub fn walk<F>(&self, mut f: F) -> TrieResult<ControlFlow<()>>
    where
        F: FnMut(RecView<'_>) -> ControlFlow<()>,
    {
        let cpu = self.cpu(self.this_cpu()?);
        let _rs = ReadSection::enter(self.hdr(), cpu);
        let mut seen = HashSet::new();
        let nroot = 1usize << self.shared.root_bits;
        Ok(self.visit_node(root_off(), nroot, &mut seen, &mut f))
    }

    /// Recursion is bounded by the word size: at most 16 levels
    fn visit_node<F>(
        &self,
        node_off: u64,
        nslots: usize,
        seen: &mut HashSet<u32>,
        f: &mut F,
    ) -> ControlFlow<()>
    where
        F: FnMut(RecView<'_>) -> ControlFlow<()>,
    {
        let base = self.base();
        for s in 0..nslots {
            let o = unsafe { node::slot_at(base, node_off, s) }.load(ORD_ACQ);
            if o == 0 {
                continue;
            }
            if o & DBIT != 0 {
                if !seen.insert(o & OMASK) {
                    continue;
                }
                self.visit_bucket(meta::di2o(o & OMASK), f)?;
            } else {
                self.visit_node(meta::ii2o(o), FANOUT, seen, f)?;
            }
        }
        ControlFlow::Continue(())
    }

    fn visit_bucket<F>(&self, boff: u64, f: &mut F) -> ControlFlow<()>
    where
        F: FnMut(RecView<'_>) -> ControlFlow<()>,
    {
        let base = self.base();
        let b = unsafe { raw::aref::<Bucket>(base, boff) };
        for s in 0..C::SLOTS {
            if !b.slot_occupied::<C>(s) {
                continue;
            }
            let roff = bucket::rec_off(boff, s, self.shared.slot_sz);
            if unsafe { bucket::slot_live(base, roff) } == 0 {
                continue;
            }
            f(unsafe { self.view_of_slot(roff) })?;
        }
        ControlFlow::Continue(())
    }
}

/// A bucket pinned under a generation guard. Dropping it lets writers
/// reclaim again, so keep it short-lived
pub struct BucketGuard<'t, C: Config> {
    trie: &'t Htrie<C>,
    cpu: u16,
    boff: u64,
    /// the guard releases the slot it entered on; it must stay on the
    /// thread that produced it
    _local: PhantomData<*mut ()>,
}

impl<'t, C: Config> BucketGuard<'t, C> {
    /// See [`Htrie::bucket_scan`]
    pub fn scan<'g>(&'g self, key: u64, i: &mut usize) -> Option<RecView<'g>> {
        self.trie.bucket_scan(self, key, i)
    }
    /// Iterator over every record with `key` in this bucket
    pub fn matches(&self, key: u64) -> Matches<'t, '_, C> {
        Matches::new(self, key)
    }
}

impl<C: Config> Drop for BucketGuard<'_, C> {
    fn drop(&mut self) {
        gen::exit(self.trie.cpu(self.cpu));
    }
}
