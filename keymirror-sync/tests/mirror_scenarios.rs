use std::fs;

use assert_fs::prelude::*;
use keymirror_core::{to_value_map, KeyDiff, KeyRecord, KeyRecords, ValueMap, WatchBatch};
use keymirror_sync::{
    apply, ensure_root,
    pipeline::{classify_batch, local_values, reconcile},
    SyncError,
};
use predicates::prelude::*;
use rstest::rstest;
use tempfile::TempDir;

const FILE_MODE: u32 = 0o660;
const DIR_MODE: u32 = 0o770;

fn values(pairs: &[(&str, &str)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect()
}

fn store_snapshot(prefix: &str, pairs: &[(&str, &str)]) -> KeyRecords {
    pairs
        .iter()
        .enumerate()
        .map(|(i, (k, v))| {
            let key = format!("{prefix}{k}");
            let record = KeyRecord {
                key: key.clone(),
                value: v.as_bytes().to_vec(),
                version: 1,
                create_revision: i as i64 + 1,
                mod_revision: i as i64 + 1,
                lease: 0,
            };
            (key, record)
        })
        .collect()
}

#[test]
fn empty_mirror_receives_every_store_key() {
    let mirror = TempDir::new().expect("mirror");
    let snapshot = store_snapshot("/configs/", &[("a", "1"), ("b", "2")]);
    let remote = to_value_map(&snapshot, "/configs/");

    let diff = reconcile(mirror.path(), &remote).expect("reconcile");
    assert_eq!(diff.inserts, values(&[("a", "1"), ("b", "2")]));
    assert!(diff.updates.is_empty() && diff.deletions.is_empty());

    apply(mirror.path(), &diff, FILE_MODE, DIR_MODE).expect("apply");
    assert_eq!(local_values(mirror.path()).expect("scan"), remote);
}

#[test]
fn file_absent_from_store_is_removed() {
    let mirror = assert_fs::TempDir::new().expect("mirror");
    mirror.child("c").write_str("x").expect("seed");

    let diff = reconcile(mirror.path(), &ValueMap::new()).expect("reconcile");
    assert_eq!(diff.deletions, vec!["c".to_string()]);

    apply(mirror.path(), &diff, FILE_MODE, DIR_MODE).expect("apply");
    mirror.child("c").assert(predicate::path::missing());
}

#[test]
fn watch_update_of_existing_key_rewrites_file() {
    let mirror = assert_fs::TempDir::new().expect("mirror");
    mirror.child("a").write_str("1").expect("seed");

    let batch = WatchBatch {
        revision: 12,
        upserts: values(&[("a", "9")]),
        deletions: vec![],
    };
    let diff = classify_batch(mirror.path(), batch).expect("classify");
    assert_eq!(diff.updates, values(&[("a", "9")]));
    assert!(diff.inserts.is_empty());

    apply(mirror.path(), &diff, FILE_MODE, DIR_MODE).expect("apply");
    mirror.child("a").assert("9");
}

#[test]
fn batches_applied_in_order_match_sequential_states() {
    let mirror = TempDir::new().expect("mirror");
    let batches = vec![
        WatchBatch {
            revision: 2,
            upserts: values(&[("k", "v1"), ("other", "o")]),
            deletions: vec![],
        },
        WatchBatch {
            revision: 3,
            upserts: values(&[("k", "v2")]),
            deletions: vec!["other".to_string()],
        },
        WatchBatch {
            revision: 4,
            upserts: ValueMap::new(),
            deletions: vec!["k".to_string()],
        },
    ];
    let expected = [
        values(&[("k", "v1"), ("other", "o")]),
        values(&[("k", "v2")]),
        ValueMap::new(),
    ];

    for (batch, expected) in batches.into_iter().zip(expected) {
        let diff = classify_batch(mirror.path(), batch).expect("classify");
        apply(mirror.path(), &diff, FILE_MODE, DIR_MODE).expect("apply");
        assert_eq!(local_values(mirror.path()).expect("scan"), expected);
    }
}

#[test]
fn partial_failure_leaves_earlier_entries_applied() {
    let mirror = TempDir::new().expect("mirror");
    fs::write(mirror.path().join("first"), "x").expect("seed");

    let diff = KeyDiff {
        deletions: vec!["first".to_string(), "missing".to_string()],
        ..KeyDiff::default()
    };
    let err = apply(mirror.path(), &diff, FILE_MODE, DIR_MODE).unwrap_err();
    assert!(matches!(err, SyncError::MissingFile { .. }), "got: {err}");
    assert!(!mirror.path().join("first").exists(), "first deletion ran");
}

#[test]
fn ensure_root_then_reconcile_on_fresh_directory() {
    let base = TempDir::new().expect("base");
    let root = base.path().join("mirror");
    ensure_root(&root, DIR_MODE).expect("ensure root");
    let diff = reconcile(&root, &values(&[("x", "1")])).expect("reconcile");
    assert_eq!(diff.inserts.len(), 1);
}

#[test]
fn file_replaced_by_directory_in_one_batch() {
    let mirror = assert_fs::TempDir::new().expect("mirror");
    mirror.child("a").write_str("leaf").expect("seed");

    let batch = WatchBatch {
        revision: 5,
        upserts: values(&[("a/b", "x")]),
        deletions: vec!["a".to_string()],
    };
    let diff = classify_batch(mirror.path(), batch).expect("classify");
    assert_eq!(diff.deletions, vec!["a".to_string()]);
    assert_eq!(diff.inserts, values(&[("a/b", "x")]));

    apply(mirror.path(), &diff, FILE_MODE, DIR_MODE).expect("apply");
    mirror.child("a").assert(predicate::path::is_dir());
    mirror.child("a/b").assert("x");
}

#[rstest]
#[case::doubled_separator("a//b")]
#[case::leading_separator("/a/b")]
#[case::trailing_separator("a/b/")]
fn keys_with_empty_segments_converge(#[case] key: &str) {
    let mirror = TempDir::new().expect("mirror");
    let remote = values(&[(key, "1")]);

    let diff = reconcile(mirror.path(), &remote).expect("reconcile");
    apply(mirror.path(), &diff, FILE_MODE, DIR_MODE).expect("apply");

    let again = reconcile(mirror.path(), &remote).expect("re-diff");
    assert!(again.is_empty(), "re-diff not empty: {again:?}");
    assert_eq!(local_values(mirror.path()).expect("scan"), values(&[("a/b", "1")]));
}

#[test]
fn watch_key_with_empty_segment_updates_the_mirrored_file() {
    let mirror = assert_fs::TempDir::new().expect("mirror");
    mirror.child("a/b").write_str("1").expect("seed");

    let batch = WatchBatch {
        revision: 9,
        upserts: values(&[("a//b", "2")]),
        deletions: vec![],
    };
    let diff = classify_batch(mirror.path(), batch).expect("classify");
    assert_eq!(diff.updates, values(&[("a/b", "2")]));
    assert!(diff.inserts.is_empty());
}
