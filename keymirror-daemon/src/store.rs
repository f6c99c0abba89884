//! Store contract consumed by the pipeline.
//!
//! The orchestrator only needs a prefix snapshot at a revision and a prefix
//! watch starting at a revision. [`crate::etcd`] implements both against
//! etcd v3; tests script them in memory.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use keymirror_core::{KeyRecords, WatchBatch};

use crate::error::StoreError;

/// Every key under a prefix, read at one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSnapshot {
    /// Full store keys (prefix included) to records.
    pub records: KeyRecords,
    pub revision: i64,
}

/// Batches of a prefix watch, prefix already trimmed.
///
/// Ends when the watch is cancelled. An `Err` item is terminal: nothing is
/// yielded after it.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchBatch, StoreError>> + Send>>;

#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn snapshot(&self, prefix: &str) -> Result<PrefixSnapshot, StoreError>;

    /// Watch `prefix` from `from_revision` on. Cancelling `cancel` closes
    /// the stream and the server-side watch.
    async fn watch(
        &self,
        prefix: &str,
        from_revision: i64,
        cancel: CancellationToken,
    ) -> Result<WatchStream, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreClient>, StoreError>;
}

/// Run `op`, retrying up to `retries` more times while it fails with
/// [`StoreError::Unavailable`]. Any other error returns at once.
pub async fn retry_unavailable<T, F, Fut>(
    retries: u64,
    interval: Duration,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_unavailable() && attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, retries, error = %err, "store unavailable, retrying");
                tokio::time::sleep(interval).await;
            }
            other => return other,
        }
    }
}

/// One event of a watch response, with the full store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Fold the events of one watch response into a batch.
///
/// Events apply in order, so the last event for a key decides whether it is
/// an upsert or a deletion. Keys lose `prefix`; keys outside it are ignored.
pub fn fold_changes(
    prefix: &str,
    revision: i64,
    events: impl IntoIterator<Item = ChangeEvent>,
) -> WatchBatch {
    let mut latest: BTreeMap<String, Option<Vec<u8>>> = BTreeMap::new();

    for event in events {
        let (key, value) = match event {
            ChangeEvent::Put { key, value } => (key, Some(value)),
            ChangeEvent::Delete { key } => (key, None),
        };
        match key.strip_prefix(prefix) {
            Some(relative) if !relative.is_empty() => {
                latest.insert(relative.to_string(), value);
            }
            _ => tracing::debug!(key = %key, "ignoring watch event outside prefix"),
        }
    }

    let mut batch = WatchBatch {
        revision,
        ..WatchBatch::default()
    };
    for (key, value) in latest {
        match value {
            Some(value) => {
                batch.upserts.insert(key, value);
            }
            None => batch.deletions.push(key),
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn put(key: &str, value: &str) -> ChangeEvent {
        ChangeEvent::Put {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn delete(key: &str) -> ChangeEvent {
        ChangeEvent::Delete {
            key: key.to_string(),
        }
    }

    #[test]
    fn fold_trims_prefix() {
        let batch = fold_changes("/configs/", 5, vec![put("/configs/a", "1"), delete("/configs/d/b")]);
        assert_eq!(batch.revision, 5);
        assert_eq!(batch.upserts.get("a"), Some(&b"1".to_vec()));
        assert_eq!(batch.deletions, vec!["d/b".to_string()]);
    }

    #[test]
    fn last_event_for_a_key_wins() {
        let batch = fold_changes(
            "/p/",
            9,
            vec![put("/p/a", "1"), delete("/p/a"), delete("/p/b"), put("/p/b", "2")],
        );
        assert_eq!(batch.deletions, vec!["a".to_string()]);
        assert_eq!(batch.upserts.len(), 1);
        assert_eq!(batch.upserts.get("b"), Some(&b"2".to_vec()));
    }

    #[test]
    fn events_outside_prefix_are_ignored() {
        let batch = fold_changes("/p/", 1, vec![put("/other/a", "1"), put("/p/", "root")]);
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_is_retried_up_to_bound() {
        let calls = AtomicU64::new(0);
        let result: Result<(), StoreError> = retry_unavailable(3, Duration::from_millis(100), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unavailable("leader lost".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_failures() {
        let calls = AtomicU64::new(0);
        let result = retry_unavailable(5, Duration::from_millis(100), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(StoreError::Unavailable("no leader".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.expect("third attempt succeeds"), 2);
    }

    #[tokio::test]
    async fn other_errors_abort_immediately() {
        let calls = AtomicU64::new(0);
        let result: Result<(), StoreError> = retry_unavailable(5, Duration::from_millis(100), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Request("permission denied".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Request(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
