//! Diff engine: reconcile the store's key space against the mirror's.

use keymirror_core::{KeyDiff, ValueMap};
use similar::TextDiff;

/// Compute what must change for `local` to equal `remote`.
///
/// Both maps are keyed relative to their roots (store prefix stripped on one
/// side, mirror root stripped on the other). Values compare by exact bytes.
/// The result depends only on the contents of the maps: inserts and updates
/// are ordered maps and deletions come out in key order.
pub fn diff_keys(remote: &ValueMap, local: &ValueMap) -> KeyDiff {
    let mut diff = KeyDiff::default();

    for (key, value) in remote {
        match local.get(key) {
            None => {
                diff.inserts.insert(key.clone(), value.clone());
            }
            Some(existing) if existing != value => {
                diff.updates.insert(key.clone(), value.clone());
            }
            Some(_) => {}
        }
    }

    diff.deletions = local
        .keys()
        .filter(|key| !remote.contains_key(*key))
        .cloned()
        .collect();

    diff
}

/// Unified diff of one key's content, mirror side (`a/`) against store side
/// (`b/`). Non-UTF-8 bytes are rendered lossily.
pub fn unified_value_diff(key: &str, local: &[u8], remote: &[u8]) -> String {
    let local = String::from_utf8_lossy(local);
    let remote = String::from_utf8_lossy(remote);
    let old_header = format!("a/{key}");
    let new_header = format!("b/{key}");
    TextDiff::from_lines(local.as_ref(), remote.as_ref())
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn values(pairs: &[(&str, &str)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn empty_mirror_inserts_everything() {
        let remote = values(&[("a", "1"), ("b", "2")]);
        let diff = diff_keys(&remote, &ValueMap::new());
        assert_eq!(diff.inserts, remote);
        assert!(diff.updates.is_empty());
        assert!(diff.deletions.is_empty());
    }

    #[test]
    fn extra_local_file_is_deleted() {
        let diff = diff_keys(&ValueMap::new(), &values(&[("c", "x")]));
        assert_eq!(diff.deletions, vec!["c".to_string()]);
        assert!(diff.inserts.is_empty() && diff.updates.is_empty());
    }

    #[test]
    fn changed_value_is_update_and_equal_value_is_noop() {
        let remote = values(&[("a", "9"), ("b", "2")]);
        let local = values(&[("a", "1"), ("b", "2")]);
        let diff = diff_keys(&remote, &local);
        assert_eq!(diff.updates, values(&[("a", "9")]));
        assert!(diff.inserts.is_empty());
        assert!(diff.deletions.is_empty());
    }

    #[test]
    fn identical_maps_yield_empty_diff() {
        let both = values(&[("a", "1"), ("dir/b", "2")]);
        assert!(diff_keys(&both, &both).is_empty());
    }

    #[test]
    fn partitions_cover_changed_keys_exactly_once() {
        let remote = values(&[("a", "1"), ("b", "2"), ("c", "3"), ("e", "5")]);
        let local = values(&[("b", "2"), ("c", "x"), ("d", "4"), ("f", "6")]);
        let diff = diff_keys(&remote, &local);

        let inserts: BTreeSet<_> = diff.inserts.keys().cloned().collect();
        let updates: BTreeSet<_> = diff.updates.keys().cloned().collect();
        let deletions: BTreeSet<_> = diff.deletions.iter().cloned().collect();

        assert!(inserts.is_disjoint(&updates));
        assert!(inserts.is_disjoint(&deletions));
        assert!(updates.is_disjoint(&deletions));
        assert_eq!(deletions.len(), diff.deletions.len());

        let all: BTreeSet<_> = inserts.union(&updates).cloned().collect();
        let all: BTreeSet<_> = all.union(&deletions).cloned().collect();
        let expected: BTreeSet<String> =
            ["a", "c", "d", "e", "f"].iter().map(|k| k.to_string()).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn unified_diff_marks_changed_lines() {
        let rendered = unified_value_diff("svc/app.conf", b"port=1\nhost=a\n", b"port=2\nhost=a\n");
        assert!(rendered.contains("--- a/svc/app.conf"));
        assert!(rendered.contains("+++ b/svc/app.conf"));
        assert!(rendered.lines().any(|l| l == "-port=1"));
        assert!(rendered.lines().any(|l| l == "+port=2"));
    }

    #[test]
    fn same_contents_give_same_diff_regardless_of_build_order() {
        let forward = values(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let mut backward = ValueMap::new();
        for (k, v) in [("c", "3"), ("b", "2"), ("a", "1")] {
            backward.insert(k.to_string(), v.as_bytes().to_vec());
        }
        let local = values(&[("z", "0"), ("b", "old")]);
        assert_eq!(diff_keys(&forward, &local), diff_keys(&backward, &local));
    }
}
