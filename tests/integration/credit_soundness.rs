#![allow(missing_docs)]

//! Every mutation runs inside a transaction that reserved exactly the
//! published credit for it. Exceeding the reservation aborts, so finishing
//! the workload is itself the check; the explicit comparisons report how
//! close the bound is.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use segstore::{
    error::StoreError,
    primitives::{
        seg::Segment,
        tx::{Credit, Tx},
    },
    storage::{
        alloc::{AllocOp, Allocator, AllocatorOptions},
        btree::{BTree, BTreeOptions, BytewiseOps, U64Ops},
        credit,
        dict::SegDict,
    },
};

fn setup(size: u64) -> (Arc<Segment>, Arc<Allocator>) {
    let seg = Arc::new(Segment::format(size).expect("format segment"));
    let alloc = Arc::new(Allocator::init(seg.clone(), AllocatorOptions::default()));
    alloc.create(None).wait().expect("create allocator");
    (seg, alloc)
}

fn tx_with(credit: Credit) -> Tx {
    let tx = Tx::new();
    tx.prep(credit);
    tx.open().expect("open tx");
    tx
}

fn assert_within(tx: &Tx) {
    assert!(
        tx.captured().fits(&tx.prepared()),
        "captured {:?} exceeds prepared {:?}",
        tx.captured(),
        tx.prepared()
    );
}

#[test]
fn allocator_calls_stay_within_their_credit() {
    let (_seg, alloc) = setup(1 << 18);
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut live = Vec::new();
    for _ in 0..400 {
        if live.is_empty() || rng.gen_bool(0.55) {
            let size = rng.gen_range(1..2048);
            let shift = rng.gen_range(3..12);
            let tx = tx_with(credit::alloc_credit(AllocOp::Alloc, size, shift));
            match alloc.alloc_aligned(Some(&tx), size, shift).wait() {
                Ok(addr) => live.push(addr),
                Err(StoreError::NoSpace { .. }) => {}
                Err(err) => panic!("alloc: {err}"),
            }
            assert_within(&tx);
        } else {
            let addr = live.swap_remove(rng.gen_range(0..live.len()));
            let tx = tx_with(credit::alloc_credit(AllocOp::Free, 0, 3));
            alloc.free_aligned(Some(&tx), Some(addr)).wait().expect("free");
            assert_within(&tx);
        }
    }
}

#[test]
fn single_tree_operations_stay_within_their_credit() {
    for fanout in [2u16, 4, 9] {
        let (seg, alloc) = setup(4 << 20);
        let tree = BTree::init(
            seg,
            alloc,
            Arc::new(BytewiseOps),
            BTreeOptions {
                fanout,
                check_invariants: false,
            },
        )
        .expect("init tree");
        let tx = tx_with(tree.create_credit());
        tree.create(Some(&tx)).wait().expect("create");
        assert_within(&tx);

        let mut rng = ChaCha8Rng::seed_from_u64(u64::from(fanout));
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for _ in 0..1_500 {
            let key: Vec<u8> = (0..rng.gen_range(1..10)).map(|_| rng.gen()).collect();
            let vsize = rng.gen_range(1..100);
            let val = vec![0x5a; vsize];
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let tx = tx_with(tree.insert_credit(1, key.len() as u64, vsize as u64));
                    if tree.insert(Some(&tx), &key, &val).wait().is_ok() {
                        keys.push(key);
                    }
                    assert_within(&tx);
                }
                2 if !keys.is_empty() => {
                    let key = &keys[rng.gen_range(0..keys.len())];
                    let tx = tx_with(tree.update_credit(1, key.len() as u64, vsize as u64));
                    tree.update(Some(&tx), key, &val).wait().expect("update");
                    assert_within(&tx);
                }
                _ if !keys.is_empty() => {
                    let key = keys.swap_remove(rng.gen_range(0..keys.len()));
                    let tx = tx_with(tree.delete_credit(1));
                    tree.delete(Some(&tx), &key).wait().expect("delete");
                    assert_within(&tx);
                }
                _ => {}
            }
        }

        let tx = tx_with(tree.save_credit(1, 3, 500));
        tree.save(Some(&tx), b"new", &[1u8; 500], true).wait().expect("save");
        assert_within(&tx);

        let tx = tx_with(tree.truncate_credit(50));
        tree.truncate(Some(&tx), 50).wait().expect("truncate");
        assert_within(&tx);

        let tx = tx_with(tree.destroy_credit());
        tree.destroy(Some(&tx)).wait().expect("destroy");
        assert_within(&tx);
    }
}

#[test]
fn batched_inserts_fit_one_reservation() {
    let (seg, alloc) = setup(4 << 20);
    let tree = BTree::init(
        seg,
        alloc,
        Arc::new(U64Ops),
        BTreeOptions {
            fanout: 3,
            check_invariants: false,
        },
    )
    .expect("init tree");
    tree.create(None).wait().expect("create");

    let tx = tx_with(tree.insert_credit(400, 8, 16));
    for k in 0..400u64 {
        tree.insert(Some(&tx), &k.to_be_bytes(), &[3u8; 16]).wait().expect("insert");
    }
    assert_within(&tx);
    assert!(tree.height() >= 4);
}

#[test]
fn dictionary_operations_stay_within_their_credit() {
    let (seg, alloc) = setup(1 << 20);
    let tx = tx_with(SegDict::create_credit(BTreeOptions::default().fanout));
    let dict = SegDict::create(seg, alloc.clone(), Some(&tx), BTreeOptions::default()).expect("create dict");
    assert_within(&tx);

    for i in 0..64u64 {
        let name = format!("tree.{i:03}");
        let addr = alloc.alloc(None, 32).wait().expect("alloc");
        let tx = tx_with(dict.insert_credit(1, name.len() as u64));
        dict.insert(Some(&tx), &name, addr).expect("insert");
        assert_within(&tx);
    }
    for i in (0..64u64).step_by(3) {
        let tx = tx_with(dict.delete_credit(1));
        dict.delete(Some(&tx), &format!("tree.{i:03}")).expect("delete");
        assert_within(&tx);
    }

    let tx = tx_with(dict.destroy_credit());
    dict.destroy(Some(&tx)).expect("destroy");
    assert_within(&tx);
}

#[test]
fn inplace_operations_fit_their_credit_through_release() {
    let (seg, alloc) = setup(1 << 20);
    let tree = BTree::init(
        seg,
        alloc,
        Arc::new(U64Ops),
        BTreeOptions {
            fanout: 3,
            check_invariants: false,
        },
    )
    .expect("init tree");
    tree.create(None).wait().expect("create");

    let batch = 40u64;
    let tx = tx_with(tree.insert_inplace_credit(batch, 8, 24));
    for k in 0..batch {
        let mut anchor = tree
            .insert_inplace(Some(&tx), &k.to_be_bytes(), 24)
            .wait()
            .expect("insert_inplace");
        anchor.with_value_mut(|buf| buf.fill(k as u8)).expect("writable");
        let region = anchor.region();
        anchor.release(Some(&tx));
        assert!(tx.covers(region));
    }
    assert_within(&tx);

    for (k, vsize) in [(3u64, 24u64), (5, 96), (7, 8), (9, 16), (5, 40)] {
        let tx = tx_with(tree.update_inplace_credit(1, 8, vsize));
        let mut anchor = tree
            .update_inplace(Some(&tx), &k.to_be_bytes(), vsize as usize)
            .wait()
            .expect("update_inplace");
        anchor.with_value_mut(|buf| buf.fill(0xcd)).expect("writable");
        anchor.release(Some(&tx));
        assert_within(&tx);
        assert_eq!(
            tree.lookup(&k.to_be_bytes()).wait().expect("lookup"),
            vec![0xcd; vsize as usize]
        );
    }

    let tx = tx_with(tree.update_inplace_credit(10, 8, 64));
    for k in 20..30u64 {
        let anchor = tree
            .update_inplace(Some(&tx), &k.to_be_bytes(), 64)
            .wait()
            .expect("update_inplace");
        anchor.release(Some(&tx));
    }
    assert_within(&tx);
    tree.check().expect("tree invariants");
}
