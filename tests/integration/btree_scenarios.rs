#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use segstore::{
    error::StoreError,
    primitives::seg::Segment,
    storage::{
        alloc::{Allocator, AllocatorOptions},
        btree::{check_tree, BTree, BTreeOptions, BytewiseOps, KvOps, U64Ops},
    },
};

struct Store {
    seg: Arc<Segment>,
    alloc: Arc<Allocator>,
}

impl Store {
    fn new(size: u64) -> Self {
        let seg = Arc::new(Segment::format(size).expect("format segment"));
        let alloc = Arc::new(Allocator::init(
            seg.clone(),
            AllocatorOptions {
                check_invariants: false,
                ..AllocatorOptions::default()
            },
        ));
        alloc.create(None).wait().expect("create allocator");
        Self { seg, alloc }
    }

    fn tree(&self, fanout: u16, ops: Arc<dyn KvOps>) -> BTree {
        BTree::init(
            self.seg.clone(),
            self.alloc.clone(),
            ops,
            BTreeOptions {
                fanout,
                check_invariants: false,
            },
        )
        .expect("init tree")
    }
}

fn random_key(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = rng.gen_range(1..6);
    (0..len).map(|_| rng.gen_range(b'a'..b'f')).collect()
}

fn random_value(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = rng.gen_range(1..40);
    (0..len).map(|_| rng.gen()).collect()
}

fn forward(tree: &BTree) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut cursor = tree.cursor();
    match cursor.first().wait() {
        Ok(()) => {}
        Err(StoreError::NotFound) => return out,
        Err(err) => panic!("first: {err}"),
    }
    loop {
        let (k, v) = cursor.kv_get().expect("positioned");
        out.push((k.to_vec(), v.to_vec()));
        match cursor.next().wait() {
            Ok(()) => {}
            Err(StoreError::NotFound) => return out,
            Err(err) => panic!("next: {err}"),
        }
    }
}

fn backward(tree: &BTree) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut cursor = tree.cursor();
    match cursor.last().wait() {
        Ok(()) => {}
        Err(StoreError::NotFound) => return out,
        Err(err) => panic!("last: {err}"),
    }
    loop {
        let (k, v) = cursor.kv_get().expect("positioned");
        out.push((k.to_vec(), v.to_vec()));
        match cursor.prev().wait() {
            Ok(()) => {}
            Err(StoreError::NotFound) => return out,
            Err(err) => panic!("prev: {err}"),
        }
    }
}

fn assert_matches(tree: &BTree, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(forward(tree), expected);
    let mut reversed = backward(tree);
    reversed.reverse();
    assert_eq!(reversed, expected);
    assert_eq!(tree.len(), model.len() as u64);
    tree.check().expect("tree invariants");
}

#[test]
fn mixed_workload_across_fanouts_matches_model() {
    for fanout in [2u16, 3, 7, 16] {
        let store = Store::new(4 << 20);
        let tree = store.tree(fanout, Arc::new(BytewiseOps));
        tree.create(None).wait().expect("create");
        let mut model = BTreeMap::new();
        let mut rng = ChaCha8Rng::seed_from_u64(u64::from(fanout) * 7919);

        for step in 0..3_000 {
            let key = random_key(&mut rng);
            match rng.gen_range(0..10) {
                0..=4 => {
                    let value = random_value(&mut rng);
                    let res = tree.insert(None, &key, &value).wait();
                    if model.contains_key(&key) {
                        assert!(matches!(res, Err(StoreError::Exists)), "step {step}");
                    } else {
                        res.expect("insert");
                        model.insert(key, value);
                    }
                }
                5..=6 => {
                    let value = random_value(&mut rng);
                    let res = tree.update(None, &key, &value).wait();
                    if model.contains_key(&key) {
                        res.expect("update");
                        model.insert(key, value);
                    } else {
                        assert!(matches!(res, Err(StoreError::NotFound)), "step {step}");
                    }
                }
                _ => {
                    let res = tree.delete(None, &key).wait();
                    if model.remove(&key).is_some() {
                        res.expect("delete");
                    } else {
                        assert!(matches!(res, Err(StoreError::NotFound)), "step {step}");
                    }
                }
            }
            if step % 500 == 0 {
                assert_matches(&tree, &model);
            }
        }
        assert_matches(&tree, &model);

        for (key, value) in &model {
            assert_eq!(&tree.lookup(key).wait().expect("lookup"), value);
        }
        if let Some((min, _)) = model.first_key_value() {
            assert_eq!(&tree.min_key().wait().expect("min"), min);
        }
        if let Some((max, _)) = model.last_key_value() {
            assert_eq!(&tree.max_key().wait().expect("max"), max);
        }
    }
}

#[test]
fn reopened_handle_sees_the_same_tree() {
    let store = Store::new(1 << 20);
    let tree = store.tree(4, Arc::new(U64Ops));
    let header = tree.create(None).wait().expect("create");
    for k in 0..500u64 {
        tree.insert(None, &(k * 3).to_be_bytes(), &k.to_le_bytes()).wait().expect("insert");
    }
    let height = tree.height();
    tree.fini();

    // A different configured fanout is ignored in favour of the header.
    let reopened = store.tree(9, Arc::new(U64Ops));
    reopened.open(header).expect("open");
    assert_eq!(reopened.fanout(), 4);
    assert_eq!(reopened.height(), height);
    assert_eq!(reopened.len(), 500);
    assert_eq!(
        reopened.lookup(&(300u64 * 3).to_be_bytes()).wait().expect("lookup"),
        300u64.to_le_bytes()
    );

    let mut cursor = reopened.cursor();
    cursor.get(&1000u64.to_be_bytes(), true).wait().expect("slanted get");
    assert_eq!(cursor.key(), Some(&1002u64.to_be_bytes()[..]));

    let pin = store.seg.pin_read();
    let summary = check_tree(&pin, header, &U64Ops).expect("check");
    assert_eq!(summary.items, 500);
    assert_eq!(summary.fanout, 4);
}

#[test]
fn truncate_then_destroy_returns_all_space() {
    let store = Store::new(1 << 20);
    let baseline = store.alloc.stats().used;
    let tree = store.tree(3, Arc::new(U64Ops));
    tree.create(None).wait().expect("create");
    for k in 0..300u64 {
        tree.insert(None, &k.to_be_bytes(), &[7u8; 24]).wait().expect("insert");
    }

    let removed = tree.truncate(None, 120).wait().expect("truncate");
    assert_eq!(removed, 120);
    assert_eq!(tree.len(), 180);
    assert_eq!(tree.min_key().wait().expect("min"), 120u64.to_be_bytes());
    tree.check().expect("tree invariants");

    tree.destroy(None).wait().expect("destroy");
    assert_eq!(store.alloc.stats().used, baseline);
    store.alloc.check().expect("allocator invariants");
}

#[test]
fn inplace_values_are_written_through_anchors() {
    let store = Store::new(1 << 20);
    let tree = store.tree(5, Arc::new(BytewiseOps));
    tree.create(None).wait().expect("create");

    for i in 0..50u8 {
        let mut anchor = tree.insert_inplace(None, &[b'k', i], 16).wait().expect("insert_inplace");
        anchor.with_value_mut(|buf| buf.fill(i)).expect("writable");
        anchor.release(None);
    }
    {
        let mut anchor = tree.update_inplace(None, &[b'k', 7], 32).wait().expect("update_inplace");
        let value = anchor.value();
        assert_eq!(&value[..16], &[7u8; 16]);
        assert!(value[16..].iter().all(|b| *b == 0));
        anchor.with_value_mut(|buf| buf[31] = 0xee).expect("writable");
        anchor.release(None);
    }
    let anchor = tree.lookup_inplace(&[b'k', 7]).wait().expect("lookup_inplace");
    assert_eq!(anchor.len(), 32);
    assert_eq!(anchor.with_value(|buf| buf[31]), 0xee);
    assert!(!anchor.is_write());
    anchor.release(None);

    assert_eq!(tree.lookup(&[b'k', 49]).wait().expect("lookup"), vec![49u8; 16]);
    tree.check().expect("tree invariants");
}

fn shape(store: &Store, tree: &BTree) -> (u16, u16, u64, u64, u64) {
    let header = tree.header().expect("attached");
    let pin = store.seg.pin_read();
    let summary = check_tree(&pin, header, &BytewiseOps).expect("check");
    (summary.fanout, summary.height, summary.nodes, summary.items, summary.kv_bytes)
}

#[test]
fn emptied_and_refilled_tree_matches_fresh_build() {
    let keys: Vec<Vec<u8>> = (0..200).map(|i| format!("{i:03}").into_bytes()).collect();
    let value = |k: &[u8]| [k, &b"-payload"[..]].concat();

    let store = Store::new(1 << 20);
    let tree = store.tree(5, Arc::new(BytewiseOps));
    tree.create(None).wait().expect("create");
    for k in &keys {
        tree.insert(None, k, &value(k)).wait().expect("insert");
    }
    assert_eq!(tree.min_key().wait().expect("min"), b"000".to_vec());
    assert_eq!(tree.max_key().wait().expect("max"), b"199".to_vec());
    tree.check().expect("tree invariants");

    let mut order = keys.clone();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(0x5eed));
    for (done, k) in order.iter().enumerate() {
        tree.delete(None, k).wait().expect("delete");
        assert!(matches!(tree.lookup(k).wait(), Err(StoreError::NotFound)));
        assert_eq!(tree.len(), (keys.len() - done - 1) as u64);
        tree.check().expect("tree invariants after delete");
    }
    assert!(tree.is_empty());
    assert_eq!(tree.height(), 1);
    assert!(matches!(tree.min_key().wait(), Err(StoreError::NotFound)));
    assert!(matches!(tree.max_key().wait(), Err(StoreError::NotFound)));

    for k in &keys {
        tree.insert(None, k, &value(k)).wait().expect("reinsert");
    }

    let fresh_store = Store::new(1 << 20);
    let fresh = fresh_store.tree(5, Arc::new(BytewiseOps));
    fresh.create(None).wait().expect("create fresh");
    for k in &keys {
        fresh.insert(None, k, &value(k)).wait().expect("fresh insert");
    }

    for k in &keys {
        assert_eq!(
            tree.lookup(k).wait().expect("lookup"),
            fresh.lookup(k).wait().expect("fresh lookup")
        );
    }
    assert_eq!(forward(&tree), forward(&fresh));
    assert_eq!(shape(&store, &tree), shape(&fresh_store, &fresh));
    assert_eq!(tree.min_key().wait().expect("min"), b"000".to_vec());
    assert_eq!(tree.max_key().wait().expect("max"), b"199".to_vec());
}
