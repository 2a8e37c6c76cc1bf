#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use segstore::{
    error::StoreError,
    primitives::seg::{Segment, SEG_HDR_LEN},
    storage::alloc::{Allocator, AllocatorOptions, CHUNK_HDR_LEN},
    types::{is_aligned, SegAddr},
};

fn allocator(size: u64) -> Allocator {
    let seg = Arc::new(Segment::format(size).expect("format segment"));
    let alloc = Allocator::init(
        seg,
        AllocatorOptions {
            check_invariants: true,
            stats_boundary: 128,
            ..AllocatorOptions::default()
        },
    );
    alloc.create(None).wait().expect("create allocator");
    alloc
}

fn assert_accounted(alloc: &Allocator) {
    let stats = alloc.stats();
    assert_eq!(
        stats.used + stats.free + stats.overhead(),
        stats.space_size,
        "{stats:?}"
    );
    alloc.check().expect("allocator invariants");
}

fn assert_disjoint(live: &BTreeMap<u64, u64>) {
    let mut prev_end = 0;
    for (&addr, &size) in live {
        assert!(addr >= prev_end + CHUNK_HDR_LEN, "block at {addr} overlaps");
        prev_end = addr + size;
    }
}

#[test]
fn random_aligned_workload_keeps_space_accounted() {
    let alloc = allocator(1 << 18);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5e65_a110c);
    let mut live: BTreeMap<u64, u64> = BTreeMap::new();

    for step in 0..2_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..600);
            let shift = rng.gen_range(3..9);
            match alloc.alloc_aligned(None, size, shift).wait() {
                Ok(addr) => {
                    assert!(is_aligned(addr.get(), shift), "step {step}: {addr} not aligned to {shift}");
                    let payload = alloc.payload_size(addr).expect("payload size");
                    assert!(payload >= size);
                    assert!(live.insert(addr.get(), payload).is_none());
                }
                Err(StoreError::NoSpace { requested }) => assert_eq!(requested, size),
                Err(err) => panic!("step {step}: unexpected error {err}"),
            }
        } else {
            let idx = rng.gen_range(0..live.len());
            let addr = *live.keys().nth(idx).expect("live block");
            live.remove(&addr);
            alloc.free(None, Some(SegAddr(addr))).wait().expect("free");
        }
        if step % 50 == 0 {
            assert_accounted(&alloc);
            assert_disjoint(&live);
        }
    }

    for addr in live.keys() {
        alloc.free(None, Some(SegAddr(*addr))).wait().expect("free");
    }
    let stats = alloc.stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.free_chunks_nr, 1);
    assert_eq!(stats.chunks_nr, 1);
    assert_eq!(stats.total.alloc_nr, stats.total.free_nr);
    assert_accounted(&alloc);
}

#[test]
fn exhaustion_fails_cleanly_and_recovers() {
    let alloc = allocator(16 << 10);
    let mut blocks = Vec::new();
    loop {
        match alloc.alloc(None, 256).wait() {
            Ok(addr) => blocks.push(addr),
            Err(StoreError::NoSpace { requested: 256 }) => break,
            Err(err) => panic!("unexpected error {err}"),
        }
    }
    assert!(!blocks.is_empty());
    let before = alloc.stats();
    assert!(before.total.fail_nr >= 1);
    assert_accounted(&alloc);

    // Every other block freed: no hole fits a large request.
    for addr in blocks.iter().step_by(2) {
        alloc.free(None, Some(*addr)).wait().expect("free");
    }
    assert!(matches!(
        alloc.alloc(None, 1024).wait(),
        Err(StoreError::NoSpace { .. })
    ));
    let reused = alloc.alloc(None, 256).wait().expect("reuse a hole");
    assert_eq!(reused, blocks[0]);
    assert_accounted(&alloc);
}

#[test]
fn small_and_large_calls_are_counted_apart() {
    let alloc = allocator(1 << 16);
    let small = alloc.alloc(None, 100).wait().expect("small");
    let large = alloc.alloc(None, 1000).wait().expect("large");
    alloc.free(None, Some(small)).wait().expect("free small");
    alloc.free(None, Some(large)).wait().expect("free large");

    let stats = alloc.stats();
    assert_eq!(stats.stats_boundary, 128);
    assert_eq!(stats.small.alloc_nr, 1);
    assert_eq!(stats.large.alloc_nr, 1);
    assert_eq!(stats.total.alloc_nr, 2);
    assert_eq!(stats.small.free_nr + stats.large.free_nr, 2);
}

fn assert_live_blocks(alloc: &Allocator, live: &[SegAddr]) {
    assert_accounted(alloc);
    let mut sizes = BTreeMap::new();
    for addr in live {
        sizes.insert(addr.get(), alloc.payload_size(*addr).expect("live payload"));
    }
    assert_disjoint(&sizes);
    assert_eq!(alloc.stats().used, sizes.values().sum::<u64>());
}

#[test]
fn megabyte_space_survives_alternating_frees() {
    let space = 1u64 << 20;
    let alloc = allocator(space + SEG_HDR_LEN as u64);
    assert_eq!(alloc.stats().space_size, space);
    let mut rng = ChaCha8Rng::seed_from_u64(0x0a11_0c8d);
    let mut alloc_block = |alloc: &Allocator| {
        let size = rng.gen_range(16..=256);
        let addr = alloc.alloc_aligned(None, size, 3).wait().expect("alloc");
        assert!(is_aligned(addr.get(), 3), "{addr} not 8-byte aligned");
        assert!(alloc.payload_size(addr).expect("payload") >= size);
        addr
    };

    let mut first = Vec::new();
    for _ in 0..100 {
        first.push(alloc_block(&alloc));
        assert_live_blocks(&alloc, &first);
    }

    let mut live: Vec<SegAddr> = first.iter().skip(1).step_by(2).copied().collect();
    for (i, addr) in first.iter().enumerate().step_by(2) {
        alloc.free(None, Some(*addr)).wait().expect("free");
        let still: Vec<SegAddr> = first
            .iter()
            .enumerate()
            .filter(|(j, _)| j % 2 == 1 || *j > i)
            .map(|(_, a)| *a)
            .collect();
        assert_live_blocks(&alloc, &still);
    }

    for _ in 0..50 {
        live.push(alloc_block(&alloc));
        assert_live_blocks(&alloc, &live);
    }
    let stats = alloc.stats();
    assert_eq!(stats.total.alloc_nr, 150);
    assert_eq!(stats.total.free_nr, 50);
    assert_eq!(stats.chunks_nr - stats.free_chunks_nr, 100);
}
