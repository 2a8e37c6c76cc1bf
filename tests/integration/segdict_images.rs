#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use segstore::{
    admin::{
        format_image, open_image, stats, verify, AdminError, AdminOpenOptions, VerifyLevel,
        VerifySeverity,
    },
    config::StoreConfig,
    error::StoreError,
    primitives::seg::Segment,
    storage::btree::{BytewiseOps, KvOps},
};
use tempfile::TempDir;

fn ops() -> Arc<dyn KvOps> {
    Arc::new(BytewiseOps)
}

fn seeded_image(name: &str) -> (TempDir, PathBuf, AdminOpenOptions) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.seg"));
    let config = StoreConfig::from_toml_str(
        r#"
        [segment]
        size = 262144

        [btree]
        fanout = 3
        check_invariants = true
        "#,
    )
    .expect("config");
    let opts = config.admin_options();
    let image = format_image(&path, config.segment.size, &opts).expect("format image");

    for name in ["accounts", "sessions"] {
        let tx = image.begin_tx(image.create_tree_credit(name)).expect("begin");
        let tree = image.create_tree(Some(&tx), name, ops()).expect("create tree");
        image.commit(&tx).expect("commit");

        let tx = image.begin_tx(tree.insert_credit(40, 13, 20)).expect("begin");
        for i in 0..40u32 {
            let key = format!("{name}-{i:04}");
            tree.insert(Some(&tx), key.as_bytes(), &[i as u8; 20]).wait().expect("insert");
        }
        image.commit(&tx).expect("commit");
    }
    (dir, path, opts)
}

#[test]
fn committed_trees_survive_reopen() {
    let (_dir, path, opts) = seeded_image("reopen");
    let image = open_image(&path, &opts).expect("open image");
    let names: Vec<String> = image.dict().list("").expect("list").into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["accounts", "sessions"]);

    let tree = image.open_tree("sessions", ops()).expect("open tree");
    assert_eq!(tree.len(), 40);
    assert_eq!(tree.lookup(b"sessions-0007").wait().expect("lookup"), vec![7u8; 20]);
    assert!(matches!(
        image.open_tree("missing", ops()),
        Err(AdminError::Core(StoreError::NotFound))
    ));
}

#[test]
fn commit_record_replays_onto_the_previous_file() {
    let (_dir, path, opts) = seeded_image("replay");
    let before = fs::read(&path).expect("read image");
    let image = open_image(&path, &opts).expect("open image");
    let tree = image.open_tree("accounts", ops()).expect("open tree");

    let tx = image.begin_tx(tree.delete_credit(10)).expect("begin");
    for i in 0..10u32 {
        tree.delete(Some(&tx), format!("accounts-{i:04}").as_bytes()).wait().expect("delete");
    }
    let record = image.commit(&tx).expect("commit");

    let mut replayed = before;
    record.apply_to_image(&mut replayed).expect("apply");
    assert_eq!(replayed, fs::read(&path).expect("read image"));
}

#[test]
fn stats_and_verify_describe_a_healthy_image() {
    let (_dir, path, opts) = seeded_image("healthy");
    let report = stats(&path, &opts).expect("stats");
    assert_eq!(report.segment.size, 262_144);
    assert_eq!(report.segment.file_size_bytes, 262_144);
    assert_eq!(report.dictionary.entries, 2);
    let accounts = &report.dictionary.trees[0];
    assert_eq!(accounts.name, "accounts");
    let summary = accounts.summary.expect("bytewise tree");
    assert_eq!(summary.items, 40);
    assert_eq!(summary.fanout, 3);
    let alloc = &report.allocator;
    assert_eq!(alloc.used + alloc.free + alloc.overhead(), alloc.space_size);

    let json = serde_json::to_value(&report).expect("json");
    assert_eq!(json["dictionary"]["trees"][1]["name"], "sessions");

    let full = verify(&path, &opts, VerifyLevel::Full).expect("verify");
    assert!(full.success, "{:?}", full.findings);
    assert_eq!(full.counts.trees_checked, 2);
    assert_eq!(full.counts.dict_entries, 2);
    assert!(full.counts.tree_items >= 82);
}

#[test]
fn verify_reports_a_damaged_tree_node() {
    let (_dir, path, opts) = seeded_image("damaged");
    let root = stats(&path, &opts).expect("stats").dictionary.trees[1]
        .summary
        .expect("bytewise tree")
        .root;

    let mut bytes = fs::read(&path).expect("read image");
    bytes[root.get() as usize + 30] ^= 0x40;
    fs::write(&path, &bytes).expect("write image");

    let fast = verify(&path, &opts, VerifyLevel::Fast).expect("verify fast");
    assert!(fast.success, "fast level does not walk registered trees");

    let full = verify(&path, &opts, VerifyLevel::Full).expect("verify full");
    assert!(!full.success);
    assert_eq!(full.counts.trees_checked, 1);
    assert!(full
        .findings
        .iter()
        .any(|f| f.severity == VerifySeverity::Error && f.message.contains("sessions")));
}

#[test]
fn foreign_files_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let opts = AdminOpenOptions::default();
    let missing = dir.path().join("missing.seg");
    assert!(matches!(open_image(&missing, &opts), Err(AdminError::MissingImage(_))));
    assert!(matches!(
        verify(&missing, &opts, VerifyLevel::Fast),
        Err(AdminError::MissingImage(_))
    ));

    let junk = dir.path().join("junk.seg");
    fs::write(&junk, vec![0u8; 8192]).expect("write junk");
    assert!(matches!(
        open_image(&junk, &opts),
        Err(AdminError::Core(StoreError::Corruption(_)))
    ));
    let report = verify(&junk, &opts, VerifyLevel::Full).expect("verify junk");
    assert!(!report.success);

    // A bare segment without an allocator is not an image.
    let bare = dir.path().join("bare.seg");
    fs::write(&bare, Segment::format(8192).expect("format").to_image()).expect("write bare");
    assert!(matches!(open_image(&bare, &opts), Err(AdminError::Message(_))));
}
