/*
 * Created on Mon Mar 11 2024
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
    super::{
        meta::{Config, DefConfig, Flags},
        Htrie,
    },
    crate::error::TrieError,
    core::ops::ControlFlow,
    memmap2::MmapMut,
    rand::Rng,
    std::{
        fs::OpenOptions,
        sync::{Arc, RwLock},
        thread::{self, JoinHandle},
    },
};

fn logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Tiny buckets so a handful of colliding keys forces a burst
struct MiniConfig;
impl Config for MiniConfig {
    const COLL_MAX: u32 = 7;
    const BURST_MIN_BITS: u32 = 2;
}

struct TestDb<C: Config> {
    _map: MmapMut,
    trie: Htrie<C>,
}

// the anonymous mapping lives inside the struct, next to the handle
unsafe impl<C: Config> Send for TestDb<C> {}
unsafe impl<C: Config> Sync for TestDb<C> {}

fn db<C: Config>(size: usize, root_bits: u32, rec_len: u32, flags: Flags) -> TestDb<C> {
    logger();
    let mut map = MmapMut::map_anon(size).unwrap();
    let trie =
        unsafe { Htrie::<C>::init(map.as_mut_ptr(), size, root_bits, rec_len, flags) }.unwrap();
    TestDb { _map: map, trie }
}

fn splitmix64(i: u64) -> u64 {
    let mut z = i.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn live_records<C: Config>(t: &Htrie<C>) -> usize {
    let mut n = 0;
    let _ = t
        .walk(|_| {
            n += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
    n
}

/* init boundaries */

#[test]
fn init_rejects_bad_shapes() {
    logger();
    let mut map = MmapMut::map_anon(1 << 20).unwrap();
    let base = map.as_mut_ptr();
    let sz = 1 << 20;
    unsafe {
        // inplace needs a record length
        assert_eq!(
            Htrie::<DefConfig>::init(base, sz, 4, 0, Flags::INPLACE).unwrap_err(),
            TrieError::InvalidUsage
        );
        // record too large for half a block
        assert_eq!(
            Htrie::<DefConfig>::init(base, sz, 4, 4096, Flags::NONE).unwrap_err(),
            TrieError::InvalidUsage
        );
        // root bits must be a nonzero multiple of four
        assert_eq!(
            Htrie::<DefConfig>::init(base, sz, 3, 0, Flags::NONE).unwrap_err(),
            TrieError::InvalidUsage
        );
        assert_eq!(
            Htrie::<DefConfig>::init(base, sz, 0, 0, Flags::NONE).unwrap_err(),
            TrieError::InvalidUsage
        );
        // an inplace bucket cannot outgrow a block
        assert_eq!(
            Htrie::<DefConfig>::init(base, sz, 4, 2048, Flags::INPLACE).unwrap_err(),
            TrieError::InvalidUsage
        );
        // the header and root must fit
        assert_eq!(
            Htrie::<DefConfig>::init(base, 8192, 4, 0, Flags::NONE).unwrap_err(),
            TrieError::InvalidUsage
        );
    }
}

#[test]
fn insert_rejects_bad_lengths() {
    let d = db::<DefConfig>(1 << 20, 4, 8, Flags::INPLACE);
    assert_eq!(d.trie.insert(1, b"").unwrap_err(), TrieError::InvalidUsage);
    assert_eq!(
        d.trie.insert(1, b"short").unwrap_err(),
        TrieError::InvalidUsage
    );
    let v = db::<DefConfig>(1 << 20, 4, 0, Flags::NONE);
    assert_eq!(v.trie.insert(1, b"").unwrap_err(), TrieError::InvalidUsage);
}

/* lookups */

#[test]
fn lookup_on_empty() {
    let d = db::<DefConfig>(1 << 20, 4, 8, Flags::INPLACE);
    assert!(d.trie.lookup(0xdeadbeef).is_none());
}

#[test]
fn insert_then_lookup_inplace() {
    let d = db::<DefConfig>(1 << 20, 4, 8, Flags::INPLACE);
    let key = 0x1122334455667788;
    let ins = d.trie.insert(key, b"ABCDEFGH").unwrap();
    assert_eq!(ins.stored, 8);
    let g = d.trie.lookup(key).unwrap();
    let mut i = 0;
    let rec = g.scan(key, &mut i).unwrap();
    assert_eq!(rec.bytes(), b"ABCDEFGH");
    i += 1;
    assert!(g.scan(key, &mut i).is_none());
}

#[test]
fn insert_then_lookup_varlen() {
    let d = db::<DefConfig>(1 << 20, 4, 0, Flags::NONE);
    let key = 0xfeedc0de;
    let ins = d.trie.insert(key, b"variable length payload").unwrap();
    assert_eq!(ins.stored, 23);
    let g = d.trie.lookup(key).unwrap();
    let rec = g.matches(key).next().unwrap();
    assert_eq!(rec.bytes(), b"variable length payload");
    let vr = rec.var().unwrap();
    assert!(vr.is_live());
    assert_eq!(vr.total_len(), 23);
}

#[test]
fn insert_then_lookup_fixed_out_of_line() {
    let d = db::<DefConfig>(1 << 20, 4, 16, Flags::NONE);
    let key = 0xbeef;
    d.trie.insert(key, b"0123456789abcdef").unwrap();
    let g = d.trie.lookup(key).unwrap();
    assert_eq!(g.matches(key).next().unwrap().bytes(), b"0123456789abcdef");
}

#[test]
fn duplicate_keys_all_scanned() {
    let d = db::<DefConfig>(1 << 20, 4, 0, Flags::NONE);
    let key = 0xaa55;
    d.trie.insert(key, b"one").unwrap();
    d.trie.insert(key, b"two").unwrap();
    let g = d.trie.lookup(key).unwrap();
    let got: Vec<_> = g.matches(key).map(|r| r.bytes().to_vec()).collect();
    assert_eq!(got.len(), 2);
    assert!(got.contains(&b"one".to_vec()));
    assert!(got.contains(&b"two".to_vec()));
}

/* burst */

#[test]
fn burst_on_overflowing_bucket() {
    // six slots per bucket: keys sharing the low nibble fill one bucket
    // and the seventh insert has to burst it
    let d = db::<MiniConfig>(1 << 20, 4, 0, Flags::NONE);
    let keys: Vec<u64> = (1..=7).map(|i| i << 4).collect();
    for &k in keys.iter().take(MiniConfig::SLOTS) {
        d.trie.insert(k, &k.to_le_bytes()).unwrap();
    }
    assert_eq!(live_records(&d.trie), 6);
    d.trie.insert(keys[6], &keys[6].to_le_bytes()).unwrap();
    for &k in &keys {
        let g = d.trie.lookup(k).unwrap();
        let rec = g.matches(k).next().unwrap();
        assert_eq!(rec.bytes(), &k.to_le_bytes());
    }
    assert_eq!(live_records(&d.trie), 7);
}

#[test]
fn no_space_when_key_entropy_is_exhausted() {
    // duplicates of one key never gain fan-out: the burst chain walks all
    // sixteen levels and the next insert must report no space
    let d = db::<MiniConfig>(1 << 20, 4, 0, Flags::NONE);
    let key = 0x5a5a5a5a5a5a5a5a;
    for _ in 0..MiniConfig::SLOTS {
        d.trie.insert(key, b"dup").unwrap();
    }
    assert_eq!(d.trie.insert(key, b"dup").unwrap_err(), TrieError::NoSpace);
    assert_eq!(live_records(&d.trie), MiniConfig::SLOTS);
    assert_eq!(
        d.trie.lookup(key).unwrap().matches(key).count(),
        MiniConfig::SLOTS
    );
    // the repeat bursts never had to alias an index slot
    assert_eq!(d.trie.burst_collisions(), 0);
}

/* remove */

#[test]
fn remove_then_lookup() {
    let d = db::<DefConfig>(1 << 20, 4, 0, Flags::NONE);
    // a and b collide on the low bits and share a bucket
    let (a, b, c) = (0xa0001u64, 0xb0001u64, 0x3u64);
    d.trie.insert(a, b"aaaa").unwrap();
    d.trie.insert(b, b"bbbb").unwrap();
    d.trie.insert(c, b"cccc").unwrap();
    d.trie.remove(a).unwrap();
    assert!(d
        .trie
        .lookup(a)
        .map(|g| g.matches(a).count() == 0)
        .unwrap_or(true));
    assert_eq!(
        d.trie.lookup(b).unwrap().matches(b).next().unwrap().bytes(),
        b"bbbb"
    );
    assert_eq!(
        d.trie.lookup(c).unwrap().matches(c).next().unwrap().bytes(),
        b"cccc"
    );
    assert_eq!(live_records(&d.trie), 2);
}

#[test]
fn remove_absent_key_is_a_noop() {
    let d = db::<DefConfig>(1 << 20, 4, 0, Flags::NONE);
    d.trie.insert(7, b"seven").unwrap();
    d.trie.remove(0x777).unwrap();
    assert_eq!(live_records(&d.trie), 1);
}

#[test]
fn remove_recycles_data_chunks() {
    let d = db::<DefConfig>(1 << 20, 4, 16, Flags::NONE);
    for round in 0..8 {
        let key = 0x100 + round;
        d.trie.insert(key, b"0123456789abcdef").unwrap();
        d.trie.remove(key).unwrap();
        assert!(d.trie.lookup(key).map(|g| g.matches(key).count() == 0).unwrap_or(true));
    }
    assert_eq!(live_records(&d.trie), 0);
}

/* extend */

#[test]
fn extend_grows_a_chunk_chain() {
    let d = db::<DefConfig>(1 << 22, 4, 0, Flags::NONE);
    let key = 0xc0ffee;
    let body = vec![0xabu8; 256];
    let ins = d.trie.insert(key, &body).unwrap();
    assert_eq!(ins.stored, 256);
    let e1 = d.trie.extend(ins.rec, 512).unwrap();
    assert_eq!(e1.stored, 512);
    let e2 = d.trie.extend(ins.rec, 1024).unwrap();
    assert_eq!(e2.stored, 1024);

    let g = d.trie.lookup(key).unwrap();
    let vr = g.matches(key).next().unwrap().var().unwrap();
    let lens: Vec<usize> = vr.chunks().map(|c| c.len()).collect();
    assert_eq!(lens, [256, 512, 1024]);
    assert_eq!(vr.total_len(), 1792);
    assert_eq!(vr.data(), &body[..]);
    drop(g);

    // the walk sees one record with the whole chain behind it
    let mut seen = 0;
    let _ = d
        .trie
        .walk(|r| {
            seen += 1;
            assert_eq!(r.var().unwrap().total_len(), 1792);
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn extend_rejected_outside_varlen() {
    let d = db::<DefConfig>(1 << 20, 4, 8, Flags::INPLACE);
    let ins = d.trie.insert(9, b"ABCDEFGH").unwrap();
    assert_eq!(d.trie.extend(ins.rec, 64).unwrap_err(), TrieError::InvalidUsage);
}

/* walk */

#[test]
fn walk_aborts_on_break() {
    let d = db::<DefConfig>(1 << 20, 4, 0, Flags::NONE);
    for k in 1..=3u64 {
        d.trie.insert(k, b"x").unwrap();
    }
    let mut n = 0;
    let flow = d
        .trie
        .walk(|_| {
            n += 1;
            ControlFlow::Break(())
        })
        .unwrap();
    assert_eq!(flow, ControlFlow::Break(()));
    assert_eq!(n, 1);
}

/* concurrency */

const SPAM_WRITERS: usize = 8;
const SPAM_READERS: usize = 8;
const SPAM_PER_WRITER: u64 = 10_000;

#[test]
fn multispam_insert_lookup_walk() {
    let d = Arc::new(db::<DefConfig>(64 << 20, 4, 0, Flags::NONE));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write().unwrap();

    let writers: Vec<JoinHandle<_>> = (0..SPAM_WRITERS as u64)
        .map(|t| {
            let this_db = d.clone();
            let this_token = token.clone();
            thread::Builder::new()
                .name(format!("w{t}"))
                .spawn(move || {
                    let _token = this_token.read().unwrap();
                    for i in 0..SPAM_PER_WRITER {
                        let key = splitmix64(t * SPAM_PER_WRITER + i);
                        this_db.trie.insert(key, &key.to_le_bytes()).unwrap();
                    }
                })
                .unwrap()
        })
        .collect();
    let readers: Vec<JoinHandle<_>> = (0..SPAM_READERS)
        .map(|t| {
            let this_db = d.clone();
            let this_token = token.clone();
            thread::Builder::new()
                .name(format!("r{t}"))
                .spawn(move || {
                    let _token = this_token.read().unwrap();
                    let mut rng = rand::thread_rng();
                    for _ in 0..SPAM_PER_WRITER {
                        let i = rng.gen_range(0..SPAM_WRITERS as u64 * SPAM_PER_WRITER);
                        let key = splitmix64(i);
                        // the writer may not have gotten there yet; if the
                        // key is in, the payload must match
                        if let Some(g) = this_db.trie.lookup(key) {
                            if let Some(rec) = g.matches(key).next() {
                                assert_eq!(rec.bytes(), &key.to_le_bytes());
                            }
                        }
                    }
                })
                .unwrap()
        })
        .collect();

    // rush everyone at once; superb intercore traffic
    drop(hold);
    writers
        .into_iter()
        .chain(readers)
        .for_each(|t| t.join().unwrap());

    assert_eq!(
        live_records(&d.trie),
        (SPAM_WRITERS as u64 * SPAM_PER_WRITER) as usize
    );
    for i in 0..SPAM_WRITERS as u64 * SPAM_PER_WRITER {
        let key = splitmix64(i);
        let g = d.trie.lookup(key).unwrap();
        assert_eq!(g.matches(key).next().unwrap().bytes(), &key.to_le_bytes());
    }
}

/* persistence shape */

#[test]
fn reattach_through_a_real_file() {
    logger();
    const SZ: usize = 4 << 20;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("htrie.db");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .unwrap();
    file.set_len(SZ as u64).unwrap();

    let keys: Vec<u64> = (0..64).map(splitmix64).collect();
    {
        let mut map = unsafe { MmapMut::map_mut(&file) }.unwrap();
        let trie =
            unsafe { Htrie::<DefConfig>::init(map.as_mut_ptr(), SZ, 4, 0, Flags::NONE) }.unwrap();
        for &k in &keys {
            trie.insert(k, &k.to_le_bytes()).unwrap();
        }
        drop(trie);
        map.flush().unwrap();
    }

    // remap; every internal reference is an offset, so a new address is fine
    let mut map = unsafe { MmapMut::map_mut(&file) }.unwrap();
    {
        let trie =
            unsafe { Htrie::<DefConfig>::init(map.as_mut_ptr(), SZ, 4, 0, Flags::NONE) }.unwrap();
        for &k in &keys {
            let g = trie.lookup(k).unwrap();
            assert_eq!(g.matches(k).next().unwrap().bytes(), &k.to_le_bytes());
        }
        assert_eq!(live_records(&trie), keys.len());
    }

    // attaching with a different shape must be refused
    assert_eq!(
        unsafe { Htrie::<DefConfig>::init(map.as_mut_ptr(), SZ, 4, 8, Flags::NONE) }.unwrap_err(),
        TrieError::InvalidUsage
    );
}
