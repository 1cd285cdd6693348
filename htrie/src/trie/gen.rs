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

/*
    generation-based reclamation
    ---
    Readers publish the global generation they observed into their per-CPU
    slot on entering a read section and the sentinel (u64::MAX) on leaving
    it. A writer that unlinked a bucket publishes a new global generation
    and spins until every slot shows a strictly greater value; slots of
    CPUs outside a read section show the sentinel and pass trivially. Read
    sections nest (an insert may run under a caller's lookup guard), so the
    slot also carries an owner-only depth counter.

    The wait is unbounded by design: read sections are short and wait-free.
*/

use {
    super::{PerCpu, TrieHdr},
    crate::sync::atm::{ORD_RLX, ORD_SEQ},
    core::{hint, sync::atomic::fence},
};

pub(super) fn enter(hdr: &TrieHdr, cpu: &PerCpu) {
    let d = cpu.depth.load(ORD_RLX);
    if d == 0 {
        cpu.generation
            .store(hdr.generation.load(ORD_SEQ), ORD_SEQ);
        // the observation must hit the coherence order before any
        // structure load of this section
        fence(ORD_SEQ);
    }
    cpu.depth.store(d + 1, ORD_RLX);
}

pub(super) fn exit(cpu: &PerCpu) {
    let d = cpu.depth.load(ORD_RLX);
    debug_assert!(d > 0, "read section underflow");
    cpu.depth.store(d - 1, ORD_RLX);
    if d == 1 {
        cpu.generation.store(u64::MAX, ORD_SEQ);
    }
}

/// Publish a new generation and wait until every CPU has observed a
/// strictly greater one. The caller must not be inside a read section.
pub(super) fn synchronize(hdr: &TrieHdr) {
    let gen = hdr.generation.fetch_add(1, ORD_SEQ) + 1;
    'spin: loop {
        for p in hdr.pcpu.iter() {
            if p.generation.load(ORD_SEQ) <= gen {
                hint::spin_loop();
                continue 'spin;
            }
        }
        return;
    }
}

/// RAII read section used by the write paths; public lookups carry the
/// section inside the bucket guard instead
pub(super) struct ReadSection<'a> {
    cpu: &'a PerCpu,
}

impl<'a> ReadSection<'a> {
    pub fn enter(hdr: &TrieHdr, cpu: &'a PerCpu) -> Self {
        self::enter(hdr, cpu);
        Self { cpu }
    }
}

impl Drop for ReadSection<'_> {
    fn drop(&mut self) {
        self::exit(self.cpu);
    }
}
