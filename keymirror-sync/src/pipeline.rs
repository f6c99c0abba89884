//! Reconcile steps shared by `keymirror diff` and the daemon pipeline.

use std::path::Path;

use keymirror_core::{to_value_map, KeyDiff, ValueMap, WatchBatch};

use crate::{
    diff_keys, scan,
    writer::{key_exists, normalize_key},
    SyncError,
};

/// Diff a store snapshot (already relative to the prefix) against the mirror.
pub fn reconcile(root: &Path, remote: &ValueMap) -> Result<KeyDiff, SyncError> {
    let local = local_values(root)?;
    Ok(diff_keys(&mirror_values(remote), &local))
}

/// Re-key store values the way the mirror stores them, so `a//b` and `/a/b`
/// compare equal to the `a/b` that [`scan`] reports.
///
/// When two keys land on the same file the greatest store key wins.
pub fn mirror_values(remote: &ValueMap) -> ValueMap {
    let mut values = ValueMap::new();
    for (key, value) in remote {
        let normalized = normalize_key(key);
        if values.insert(normalized.clone(), value.clone()).is_some() {
            tracing::warn!("key '{key}' shares mirror file '{normalized}' with another key");
        }
    }
    values
}

/// The mirror's current contents, keyed relative to `root`.
pub fn local_values(root: &Path) -> Result<ValueMap, SyncError> {
    Ok(to_value_map(&scan(root)?, ""))
}

/// Turn a watch batch into a diff against the current mirror.
///
/// An upsert whose file already exists is an update, otherwise an insert.
/// A deletion whose file is already gone is dropped: the watch may report a
/// key that was created and removed before the mirror ever saw it.
pub fn classify_batch(root: &Path, batch: WatchBatch) -> Result<KeyDiff, SyncError> {
    let mut diff = KeyDiff::default();
    let upserts = mirror_values(&batch.upserts);

    for key in batch.deletions {
        let key = normalize_key(&key);
        if upserts.contains_key(&key) || diff.deletions.contains(&key) {
            continue;
        }
        if key_exists(root, &key)? {
            diff.deletions.push(key);
        } else {
            tracing::debug!("dropping deletion of '{key}': not in mirror");
        }
    }

    for (key, value) in upserts {
        if key_exists(root, &key)? {
            diff.updates.insert(key, value);
        } else {
            diff.inserts.insert(key, value);
        }
    }

    Ok(diff)
}
