//! Reconciliation: folding every labeled batch a user has sent into one
//! deduplicated corpus.
//!
//! The corpus is always rebuilt from scratch out of all historical batches,
//! so running it twice is harmless. Runs for the same user are serialized
//! within a process; separate processes still race on the final write and
//! the last writer wins.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::environment::Buckets;
use crate::storage::{keys, read_table, write_table, ObjectStore, StorageError};
use crate::table::{DuplicatePolicy, Table};
use crate::TARGET_STORAGE;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("object key '{0}' does not start with a username")]
    InvalidKey(String),
    #[error("notification contains no records")]
    EmptyNotification,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Storage-change notification as delivered by S3.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectEntity {
    /// URL form encoded, as S3 sends it.
    pub key: String,
}

impl StorageEvent {
    /// Builds a single-record notification, e.g. for a manual run.
    pub fn for_object(bucket: &str, key: &str) -> Self {
        StorageEvent {
            records: vec![EventRecord {
                s3: S3Entity {
                    bucket: BucketEntity {
                        name: bucket.to_string(),
                    },
                    object: ObjectEntity {
                        key: url::form_urlencoded::byte_serialize(key.as_bytes())
                            .collect::<String>()
                            .replace("%2F", "/"),
                    },
                },
            }],
        }
    }

    /// Distinct `(bucket, username)` pairs named by the notification, in
    /// arrival order.
    pub fn targets(&self) -> Result<Vec<(String, String)>, ReconcileError> {
        if self.records.is_empty() {
            return Err(ReconcileError::EmptyNotification);
        }

        let mut targets: Vec<(String, String)> = Vec::new();
        for record in &self.records {
            let key = keys::decode_event_key(&record.s3.object.key);
            let username = keys::username_from_key(&key)
                .ok_or_else(|| ReconcileError::InvalidKey(key.clone()))?
                .to_string();
            let target = (record.s3.bucket.name.clone(), username);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        Ok(targets)
    }
}

/// Outcome of one user's reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub username: String,
    pub batches: usize,
    pub rows_processed: usize,
    pub key: String,
}

/// Concatenates batches in order and collapses repeated articles.
pub fn merge_batches(batches: Vec<Table>, policy: DuplicatePolicy) -> Table {
    Table::concat(batches).dedup_by_key(policy)
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    buckets: Buckets,
    policy: DuplicatePolicy,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, buckets: Buckets, policy: DuplicatePolicy) -> Self {
        Reconciler {
            store,
            buckets,
            policy,
            locks: DashMap::new(),
        }
    }

    fn user_lock(&self, username: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Rebuilds `username`'s corpus from every batch in `source_bucket`.
    ///
    /// Batches are read in key order, which is chronological because batch
    /// keys embed their timestamp. With no batches nothing is written.
    ///
    /// # Arguments
    /// * `source_bucket` - Bucket holding the user's raw labeled batches.
    /// * `username` - Owner of the batches; also the key prefix.
    ///
    /// # Returns
    /// A report with the number of rows written to the processed bucket.
    pub async fn reconcile(
        &self,
        source_bucket: &str,
        username: &str,
    ) -> Result<ReconcileReport, ReconcileError> {
        if !keys::is_valid_username(username) {
            return Err(ReconcileError::InvalidKey(username.to_string()));
        }

        let lock = self.user_lock(username);
        let result = {
            let _guard = lock.lock().await;
            self.rebuild(source_bucket, username).await
        };
        drop(lock);

        // Nobody else holds or waits on the lock once only the map owns it.
        self.locks
            .remove_if(username, |_, entry| Arc::strong_count(entry) == 1);
        result
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.locks.len()
    }

    async fn rebuild(
        &self,
        source_bucket: &str,
        username: &str,
    ) -> Result<ReconcileReport, ReconcileError> {
        let batch_keys = self
            .store
            .list(source_bucket, &keys::user_prefix(username))
            .await?;
        let destination = keys::processed_key(username);

        if batch_keys.is_empty() {
            warn!(target: TARGET_STORAGE, "No labeled batches found for {} in {}", username, source_bucket);
            return Ok(ReconcileReport {
                username: username.to_string(),
                batches: 0,
                rows_processed: 0,
                key: destination,
            });
        }

        let mut batches = Vec::with_capacity(batch_keys.len());
        for key in &batch_keys {
            batches.push(read_table(self.store.as_ref(), source_bucket, key).await?);
        }

        let corpus = merge_batches(batches, self.policy);
        write_table(self.store.as_ref(), &self.buckets.processed, &destination, &corpus).await?;

        info!(
            target: TARGET_STORAGE,
            "Reconciled {} batches for {} into {} rows at {}/{}",
            batch_keys.len(),
            username,
            corpus.len(),
            self.buckets.processed,
            destination
        );

        Ok(ReconcileReport {
            username: username.to_string(),
            batches: batch_keys.len(),
            rows_processed: corpus.len(),
            key: destination,
        })
    }

    /// Reconciles every user named in a storage-change notification.
    ///
    /// # Arguments
    /// * `event` - Notification listing the objects that were written.
    ///
    /// # Returns
    /// One report per distinct user, in order of first appearance.
    pub async fn handle_event(
        &self,
        event: &StorageEvent,
    ) -> Result<Vec<ReconcileReport>, ReconcileError> {
        let mut reports = Vec::new();
        for (bucket, username) in event.targets()? {
            reports.push(self.reconcile(&bucket, &username).await?);
        }
        Ok(reports)
    }

    /// Reconciles a user from the configured raw-labeled bucket.
    pub async fn reconcile_user(&self, username: &str) -> Result<ReconcileReport, ReconcileError> {
        let bucket = self.buckets.raw_labeled.clone();
        self.reconcile(&bucket, username).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::table::row_key;
    use serde_json::{json, Value};

    fn table(rows: Value) -> Table {
        let Value::Array(rows) = rows else {
            panic!("expected array");
        };
        Table::from_rows(rows.into_iter().filter_map(|row| match row {
            Value::Object(row) => Some(row),
            _ => None,
        }))
    }

    fn reconciler(store: Arc<MemoryStore>, policy: DuplicatePolicy) -> Reconciler {
        Reconciler::new(store, Buckets::default(), policy)
    }

    async fn put_batch(store: &MemoryStore, key: &str, rows: Value) {
        write_table(store, &Buckets::default().raw_labeled, key, &table(rows))
            .await
            .unwrap();
    }

    async fn corpus(store: &MemoryStore, username: &str) -> Table {
        read_table(
            store,
            &Buckets::default().processed,
            &keys::processed_key(username),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_merge_two_batches_keep_first() {
        let b1 = table(json!([{"article_id": 1, "label": "A"}]));
        let b2 = table(json!([{"article_id": 1, "label": "B"}, {"article_id": 2, "label": "C"}]));
        let merged = merge_batches(vec![b1, b2], DuplicatePolicy::KeepFirst);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.rows()[0]["label"], "A");
        assert_eq!(merged.rows()[1]["label"], "C");
    }

    #[test]
    fn test_merge_two_batches_keep_last() {
        let b1 = table(json!([{"article_id": 1, "label": "A"}]));
        let b2 = table(json!([{"article_id": 1, "label": "B"}, {"article_id": 2, "label": "C"}]));
        let merged = merge_batches(vec![b1, b2], DuplicatePolicy::KeepLast);

        let labels: Vec<&Value> = merged.rows().iter().map(|row| &row["label"]).collect();
        assert_eq!(labels, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_reconcile_unions_batches_without_duplicates() {
        let store = Arc::new(MemoryStore::new());
        put_batch(
            &store,
            "ana/raw_labeled_data_20240101_090000.000.parquet.gzip",
            json!([{"article_id": 1, "label": "A"}, {"article_id": 3, "label": "D"}]),
        )
        .await;
        put_batch(
            &store,
            "ana/raw_labeled_data_20240102_090000.000.parquet.gzip",
            json!([{"article_id": 1, "label": "B"}, {"article_id": 2, "label": "C"}]),
        )
        .await;
        put_batch(
            &store,
            "bo/raw_labeled_data_20240102_090000.000.parquet.gzip",
            json!([{"article_id": 9, "label": "Z"}]),
        )
        .await;

        let report = reconciler(store.clone(), DuplicatePolicy::KeepFirst)
            .reconcile_user("ana")
            .await
            .unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(report.rows_processed, 3);
        assert_eq!(report.key, "ana/processed_labeled_dataset.parquet.gzip");

        let corpus = corpus(&store, "ana").await;
        let ids: Vec<String> = corpus.rows().iter().filter_map(row_key).collect();
        assert_eq!(ids, vec!["1", "3", "2"]);
        assert_eq!(corpus.rows()[0]["label"], "A");
    }

    #[tokio::test]
    async fn test_reconcile_overwrites_previous_corpus() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler(store.clone(), DuplicatePolicy::KeepFirst);

        put_batch(&store, "ana/raw_labeled_data_1.parquet.gzip", json!([{"article_id": 1}])).await;
        reconciler.reconcile_user("ana").await.unwrap();
        put_batch(&store, "ana/raw_labeled_data_2.parquet.gzip", json!([{"article_id": 2}])).await;
        let report = reconciler.reconcile_user("ana").await.unwrap();

        assert_eq!(report.rows_processed, 2);
        assert_eq!(corpus(&store, "ana").await.key_set().len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_without_batches_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let report = reconciler(store.clone(), DuplicatePolicy::KeepFirst)
            .reconcile_user("ana")
            .await
            .unwrap();
        assert_eq!(report.rows_processed, 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_reconcile_fails_on_corrupt_batch() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(
                &Buckets::default().raw_labeled,
                "ana/raw_labeled_data_1.parquet.gzip",
                b"garbage".to_vec(),
            )
            .await
            .unwrap();

        let err = reconciler(store.clone(), DuplicatePolicy::KeepFirst)
            .reconcile_user("ana")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Storage(StorageError::Corrupt { .. })));
        assert!(
            !store
                .contains(&Buckets::default().processed, &keys::processed_key("ana"))
                .await
        );
    }

    #[tokio::test]
    async fn test_handle_event_uses_first_key_segment() {
        let store = Arc::new(MemoryStore::new());
        put_batch(
            &store,
            "jose luis/raw_labeled_data_1.parquet.gzip",
            json!([{"article_id": 5}]),
        )
        .await;

        let event: StorageEvent = serde_json::from_value(json!({
            "Records": [
                {"s3": {"bucket": {"name": "raw-labeled-news-data"},
                        "object": {"key": "jose+luis/raw_labeled_data_1.parquet.gzip"}}},
                {"s3": {"bucket": {"name": "raw-labeled-news-data"},
                        "object": {"key": "jose+luis/raw_labeled_data_1.parquet.gzip"}}}
            ]
        }))
        .unwrap();

        let reports = reconciler(store.clone(), DuplicatePolicy::KeepFirst)
            .handle_event(&event)
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].username, "jose luis");
        assert_eq!(reports[0].rows_processed, 1);
    }

    #[test]
    fn test_event_targets_reject_keys_without_user() {
        let event = StorageEvent::for_object("raw", "orphan.parquet.gzip");
        assert!(matches!(event.targets(), Err(ReconcileError::InvalidKey(_))));
        assert!(matches!(
            StorageEvent { records: vec![] }.targets(),
            Err(ReconcileError::EmptyNotification)
        ));
    }

    #[test]
    fn test_event_for_object_round_trips_key() {
        let event = StorageEvent::for_object("raw", "jose luis/raw_labeled_data_1.parquet.gzip");
        assert_eq!(
            event.targets().unwrap(),
            vec![("raw".to_string(), "jose luis".to_string())]
        );
    }

    #[tokio::test]
    async fn test_concurrent_runs_for_same_user_agree() {
        let store = Arc::new(MemoryStore::new());
        put_batch(&store, "ana/raw_labeled_data_1.parquet.gzip", json!([{"article_id": 1}])).await;
        put_batch(&store, "ana/raw_labeled_data_2.parquet.gzip", json!([{"article_id": 2}])).await;

        let reconciler = Arc::new(reconciler(store.clone(), DuplicatePolicy::KeepFirst));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.reconcile_user("ana").await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().rows_processed, 2);
        }
        assert_eq!(reconciler.tracked_users(), 0);
    }

    #[tokio::test]
    async fn test_user_locks_are_released_after_each_run() {
        let store = Arc::new(MemoryStore::new());
        put_batch(&store, "ana/raw_labeled_data_1.parquet.gzip", json!([{"article_id": 1}])).await;
        let reconciler = reconciler(store.clone(), DuplicatePolicy::KeepFirst);

        for username in ["ana", "bo", "cy"] {
            reconciler.reconcile_user(username).await.unwrap();
        }
        assert_eq!(reconciler.tracked_users(), 0);

        store.set_read_only(true);
        assert!(reconciler.reconcile_user("ana").await.is_err());
        assert_eq!(reconciler.tracked_users(), 0);
    }
}
