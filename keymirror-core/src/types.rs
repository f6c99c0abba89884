//! Domain types shared by the store, the filesystem mirror and the notifiers.
//!
//! Keys are always `/`-separated strings. Values are raw bytes: the mirror
//! holds arbitrary configuration artifacts, not only text.

use std::collections::{BTreeMap, HashSet};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Relative key → value. Ordered so that every derived diff iterates
/// deterministically.
pub type ValueMap = BTreeMap<String, Vec<u8>>;

/// Key → full record, as returned by a store snapshot or a mirror scan.
pub type KeyRecords = BTreeMap<String, KeyRecord>;

/// One key of the store (or one file of the mirror).
///
/// Identity is `key`; diffing only ever compares `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub version: i64,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub lease: i64,
}

impl KeyRecord {
    /// A record read from the filesystem: there is no revision metadata.
    pub fn from_file(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            version: 0,
            create_revision: 0,
            mod_revision: 0,
            lease: 0,
        }
    }
}

/// Project records onto a [`ValueMap`] keyed relative to `prefix`.
///
/// Keys that do not start with `prefix` are kept verbatim.
pub fn to_value_map(records: &KeyRecords, prefix: &str) -> ValueMap {
    records
        .values()
        .map(|record| {
            let key = record.key.strip_prefix(prefix).unwrap_or(&record.key);
            (key.to_string(), record.value.clone())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Watch batches
// ---------------------------------------------------------------------------

/// One successful emission of a prefix watch, with the prefix already trimmed.
///
/// Upserts are not yet classified as inserts or updates: that needs to know
/// what the mirror currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub revision: i64,
    pub upserts: ValueMap,
    pub deletions: Vec<String>,
}

impl WatchBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// KeyDiff
// ---------------------------------------------------------------------------

/// The change set between two key spaces.
///
/// A key appears in at most one of `inserts`, `updates` and `deletions`.
/// Derived copies ([`KeyDiff::filter_keys`], [`KeyDiff::transform_keys`])
/// keep that invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDiff {
    pub inserts: ValueMap,
    pub updates: ValueMap,
    pub deletions: Vec<String>,
}

impl KeyDiff {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }

    /// Total number of entries across the three collections.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletions.len()
    }

    /// Inserts followed by updates. The filesystem treats both the same way.
    pub fn upserts(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.inserts.iter().chain(self.updates.iter())
    }

    /// Keep only the entries whose key satisfies `keep`.
    pub fn filter_keys(&self, keep: impl Fn(&str) -> bool) -> KeyDiff {
        KeyDiff {
            inserts: self
                .inserts
                .iter()
                .filter(|(key, _)| keep(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            updates: self
                .updates
                .iter()
                .filter(|(key, _)| keep(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            deletions: self
                .deletions
                .iter()
                .filter(|key| keep(key))
                .cloned()
                .collect(),
        }
    }

    /// Rewrite every key through `rewrite`.
    ///
    /// Collisions resolve deterministically. Inside one collection the
    /// entry with the greatest source key wins (maps iterate in key order).
    /// Across collections inserts beat updates and both beat deletions, so a
    /// rewritten key still lands in exactly one collection.
    pub fn transform_keys(&self, rewrite: impl Fn(&str) -> String) -> KeyDiff {
        let mut collisions = 0usize;

        let mut seen = HashSet::new();
        let mut deletions = Vec::with_capacity(self.deletions.len());
        for key in &self.deletions {
            let key = rewrite(key);
            if seen.insert(key.clone()) {
                deletions.push(key);
            } else {
                collisions += 1;
            }
        }

        let mut updates = ValueMap::new();
        for (key, value) in &self.updates {
            if updates.insert(rewrite(key), value.clone()).is_some() {
                collisions += 1;
            }
        }

        let mut inserts = ValueMap::new();
        for (key, value) in &self.inserts {
            if inserts.insert(rewrite(key), value.clone()).is_some() {
                collisions += 1;
            }
        }

        let before = updates.len() + deletions.len();
        updates.retain(|key, _| !inserts.contains_key(key));
        deletions.retain(|key| !inserts.contains_key(key) && !updates.contains_key(key));
        collisions += before - (updates.len() + deletions.len());

        if collisions > 0 {
            tracing::warn!(collisions, "key transform mapped distinct keys onto the same key");
        }

        KeyDiff {
            inserts,
            updates,
            deletions,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    fn sample() -> KeyDiff {
        KeyDiff {
            inserts: values(&[("svc/a", "1"), ("other/b", "2")]),
            updates: values(&[("svc/c", "3")]),
            deletions: vec!["other/d".to_string(), "svc/e".to_string()],
        }
    }

    #[test]
    fn default_diff_is_empty() {
        assert!(KeyDiff::default().is_empty());
        assert_eq!(KeyDiff::default().len(), 0);
        assert!(!sample().is_empty());
        assert_eq!(sample().len(), 5);
    }

    #[test]
    fn filter_applies_to_each_collection() {
        let filtered = sample().filter_keys(|key| key.starts_with("svc/"));
        assert_eq!(filtered.inserts, values(&[("svc/a", "1")]));
        assert_eq!(filtered.updates, values(&[("svc/c", "3")]));
        assert_eq!(filtered.deletions, vec!["svc/e".to_string()]);
    }

    #[test]
    fn filter_rejecting_everything_is_empty() {
        assert!(sample().filter_keys(|_| false).is_empty());
    }

    #[test]
    fn filter_twice_equals_filter_once() {
        let keep = |key: &str| key.contains('a') || key.ends_with('e');
        let once = sample().filter_keys(keep);
        assert_eq!(once.filter_keys(keep), once);
    }

    #[test]
    fn transform_rewrites_every_key() {
        let out = sample().transform_keys(|key| key.to_uppercase());
        assert!(out.inserts.contains_key("SVC/A"));
        assert!(out.updates.contains_key("SVC/C"));
        assert_eq!(out.deletions, vec!["OTHER/D".to_string(), "SVC/E".to_string()]);
    }

    #[test]
    fn transform_collision_within_collection_keeps_greatest_source_key() {
        let diff = KeyDiff {
            inserts: values(&[("a/x", "first"), ("b/x", "second")]),
            ..KeyDiff::default()
        };
        let out = diff.transform_keys(|key| key.rsplit('/').next().unwrap_or(key).to_string());
        assert_eq!(out.inserts, values(&[("x", "second")]));
    }

    #[test]
    fn transform_collision_across_collections_keeps_one_entry() {
        let diff = KeyDiff {
            inserts: values(&[("a/x", "new")]),
            updates: values(&[("b/x", "changed"), ("b/y", "kept")]),
            deletions: vec!["c/x".to_string(), "c/y".to_string(), "c/z".to_string()],
        };
        let out = diff.transform_keys(|key| key.rsplit('/').next().unwrap_or(key).to_string());
        assert_eq!(out.inserts, values(&[("x", "new")]));
        assert_eq!(out.updates, values(&[("y", "kept")]));
        assert_eq!(out.deletions, vec!["z".to_string()]);
    }

    #[test]
    fn value_map_strips_prefix() {
        let mut records = KeyRecords::new();
        for key in ["/conf/a", "/conf/dir/b"] {
            records.insert(key.to_string(), KeyRecord::from_file(key, b"v".to_vec()));
        }
        let map = to_value_map(&records, "/conf/");
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a", "dir/b"]);
    }

    #[test]
    fn file_records_have_no_store_metadata() {
        let record = KeyRecord::from_file("a", b"1".to_vec());
        assert_eq!(
            (record.version, record.create_revision, record.mod_revision, record.lease),
            (0, 0, 0, 0)
        );
    }
}
