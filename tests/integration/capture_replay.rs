#![allow(missing_docs)]

//! Replaying a transaction record over the image taken before the
//! transaction must reproduce the image after it byte for byte. Any
//! modified range the code forgot to capture shows up as a mismatch.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use segstore::{
    primitives::{
        seg::Segment,
        tx::{Credit, Tx, TxRecord},
    },
    storage::{
        alloc::{Allocator, AllocatorOptions},
        btree::{BTree, BTreeOptions, BytewiseOps},
        dict::SegDict,
    },
};

fn setup() -> (Arc<Segment>, Arc<Allocator>) {
    let seg = Arc::new(Segment::format(2 << 20).expect("format segment"));
    let alloc = Arc::new(Allocator::init(seg.clone(), AllocatorOptions::default()));
    alloc.create(None).wait().expect("create allocator");
    (seg, alloc)
}

fn replay_matches(seg: &Segment, before: &[u8], record: &TxRecord) {
    let mut replayed = before.to_vec();
    record.apply_to_image(&mut replayed).expect("apply record");
    let after = seg.to_image();
    if let Some(pos) = replayed.iter().zip(&after).position(|(a, b)| a != b) {
        panic!("uncaptured change at offset {pos} in tx {}", record.tx());
    }
}

fn run_tx(seg: &Segment, credit: Credit, body: impl FnOnce(&Tx)) {
    let before = seg.to_image();
    let tx = Tx::new();
    tx.prep(credit);
    tx.open().expect("open tx");
    body(&tx);
    let record = tx.close(seg);
    replay_matches(seg, &before, &record);
}

#[test]
fn allocator_and_tree_changes_are_fully_captured() {
    let (seg, alloc) = setup();
    let tree = BTree::init(
        seg.clone(),
        alloc.clone(),
        Arc::new(BytewiseOps),
        BTreeOptions {
            fanout: 3,
            check_invariants: false,
        },
    )
    .expect("init tree");
    run_tx(&seg, tree.create_credit(), |tx| {
        tree.create(Some(tx)).wait().expect("create");
    });

    let mut rng = ChaCha8Rng::seed_from_u64(0xcafe);
    let mut keys = Vec::new();
    for round in 0..60 {
        let batch = 10u64;
        let credit = tree.insert_credit(batch, 6, 48) + tree.delete_credit(batch);
        run_tx(&seg, credit, |tx| {
            for _ in 0..batch {
                let key: Vec<u8> = (0..6).map(|_| rng.gen_range(b'0'..=b'9')).collect();
                let val = vec![round as u8; rng.gen_range(1..48)];
                if tree.insert(Some(tx), &key, &val).wait().is_ok() {
                    keys.push(key);
                }
            }
            for _ in 0..rng.gen_range(0..batch) {
                if keys.is_empty() {
                    break;
                }
                let key = keys.swap_remove(rng.gen_range(0..keys.len()));
                tree.delete(Some(tx), &key).wait().expect("delete");
            }
        });
    }

    run_tx(&seg, tree.destroy_credit(), |tx| {
        tree.destroy(Some(tx)).wait().expect("destroy");
    });
    assert_eq!(alloc.stats().used, 0);
}

#[test]
fn replayed_image_reopens_with_the_same_contents() {
    let (seg, alloc) = setup();
    let before = seg.to_image();

    let options = BTreeOptions::default();
    let tx = Tx::new();
    tx.prep(SegDict::create_credit(options.fanout) + Credit::new(4_000, 1 << 22));
    tx.open().expect("open tx");
    let dict = SegDict::create(seg.clone(), alloc.clone(), Some(&tx), options.clone()).expect("create dict");
    for i in 0..20u64 {
        let addr = alloc.alloc(Some(&tx), 16 + i).wait().expect("alloc");
        dict.insert(Some(&tx), &format!("obj{i:02}"), addr).expect("insert");
    }
    let record = tx.close(&seg);

    let mut image = before;
    record.apply_to_image(&mut image).expect("apply record");
    let copy = Arc::new(Segment::from_image(image).expect("reload image"));
    let copy_alloc = Arc::new(Allocator::init(copy.clone(), AllocatorOptions::default()));
    copy_alloc.check().expect("allocator invariants");
    let reopened = SegDict::open(copy, copy_alloc, options).expect("open dict");
    assert_eq!(reopened.list("").expect("list"), dict.list("").expect("list"));
}
