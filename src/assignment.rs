//! Work assignment: the articles a user still owes.

use tracing::info;

use crate::environment::Buckets;
use crate::storage::{keys, read_table, read_table_if_exists, ObjectStore, StorageError};
use crate::table::Table;
use crate::TARGET_STORAGE;

/// Pool rows whose `article_id` is absent from the labeled corpus, in pool
/// order. With no corpus the whole pool is pending.
pub fn pending_articles(pool: Table, corpus: Option<&Table>) -> Table {
    match corpus {
        Some(corpus) => pool.without_keys(&corpus.key_set()),
        None => pool,
    }
}

/// Loads `username`'s pool and reconciled corpus and returns what is left to
/// label.
///
/// A missing corpus means nothing has been labeled yet. Any other failure,
/// including a missing pool, is returned to the caller.
///
/// # Arguments
/// * `store` - Object store holding both buckets.
/// * `buckets` - Names of the unlabeled and processed buckets.
/// * `username` - User whose pool is read; also the key prefix.
///
/// # Returns
/// The pool rows not yet in the corpus, in pool order.
pub async fn get_unlabeled(
    store: &dyn ObjectStore,
    buckets: &Buckets,
    username: &str,
) -> Result<Table, StorageError> {
    info!(target: TARGET_STORAGE, "Retrieving data for username {}", username);

    let pool = read_table(store, &buckets.unlabeled, &keys::unlabeled_key(username)).await?;
    let corpus =
        read_table_if_exists(store, &buckets.processed, &keys::processed_key(username)).await?;

    let pool_size = pool.len();
    let pending = pending_articles(pool, corpus.as_ref());
    info!(
        target: TARGET_STORAGE,
        "{} has {} of {} articles left to label",
        username,
        pending.len(),
        pool_size
    );
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{write_table, MemoryStore};
    use crate::table::row_key;
    use arrow_array::{Int64Array, RecordBatch, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use parquet::arrow::ArrowWriter;
    use parquet::basic::Compression;
    use parquet::file::properties::WriterProperties;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn table(rows: Value) -> Table {
        let Value::Array(rows) = rows else {
            panic!("expected array");
        };
        Table::from_rows(rows.into_iter().filter_map(|row| match row {
            Value::Object(row) => Some(row),
            _ => None,
        }))
    }

    fn ids(table: &Table) -> Vec<String> {
        table.rows().iter().filter_map(row_key).collect()
    }

    #[test]
    fn test_pending_is_pool_minus_corpus() {
        let pool = table(json!([{"article_id": 1}, {"article_id": 2}, {"article_id": 3}]));
        let corpus = table(json!([{"article_id": 2}]));
        assert_eq!(ids(&pending_articles(pool, Some(&corpus))), vec!["1", "3"]);
    }

    #[test]
    fn test_pending_without_corpus_is_whole_pool() {
        let pool = table(json!([{"article_id": 1}, {"article_id": 2}]));
        assert_eq!(ids(&pending_articles(pool.clone(), None)), vec!["1", "2"]);
        assert_eq!(pending_articles(pool.clone(), Some(&Table::new())), pool);
    }

    #[test]
    fn test_pending_matches_string_and_integer_ids() {
        let pool = table(json!([{"article_id": 10}, {"article_id": "11"}]));
        let corpus = table(json!([{"article_id": "10"}, {"article_id": 11}]));
        assert!(pending_articles(pool, Some(&corpus)).is_empty());
    }

    #[tokio::test]
    async fn test_get_unlabeled_without_prior_corpus() {
        let store = MemoryStore::new();
        let buckets = Buckets::default();
        let pool = table(json!([{"article_id": 1, "title": "a"}, {"article_id": 2, "title": "b"}]));
        write_table(&store, &buckets.unlabeled, &keys::unlabeled_key("ana"), &pool)
            .await
            .unwrap();

        let pending = get_unlabeled(&store, &buckets, "ana").await.unwrap();
        assert_eq!(pending, pool);
    }

    #[tokio::test]
    async fn test_get_unlabeled_subtracts_corpus() {
        let store = MemoryStore::new();
        let buckets = Buckets::default();
        let pool = table(json!([{"article_id": 1}, {"article_id": 2}, {"article_id": 3}]));
        let corpus = table(json!([{"article_id": 2, "sentiment": "Neutral"}]));
        write_table(&store, &buckets.unlabeled, &keys::unlabeled_key("ana"), &pool)
            .await
            .unwrap();
        write_table(&store, &buckets.processed, &keys::processed_key("ana"), &corpus)
            .await
            .unwrap();

        let pending = get_unlabeled(&store, &buckets, "ana").await.unwrap();
        assert_eq!(ids(&pending), vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_missing_pool_is_an_error() {
        let store = MemoryStore::new();
        let err = get_unlabeled(&store, &Buckets::default(), "ana")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_corrupt_corpus_is_an_error() {
        let store = MemoryStore::new();
        let buckets = Buckets::default();
        let pool = table(json!([{"article_id": 1}]));
        write_table(&store, &buckets.unlabeled, &keys::unlabeled_key("ana"), &pool)
            .await
            .unwrap();
        store
            .put(&buckets.processed, &keys::processed_key("ana"), b"not a table".to_vec())
            .await
            .unwrap();

        let err = get_unlabeled(&store, &buckets, "ana").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_reads_pool_from_external_parquet_writer() {
        // A Snappy file with a non-nullable id column, as an ingestion job
        // outside this crate writes it.
        let schema = Arc::new(Schema::new(vec![
            Field::new("article_id", DataType::Int64, false),
            Field::new("title", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])),
            ],
        )
        .unwrap();
        let properties = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut bytes = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut bytes, schema, Some(properties)).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let store = MemoryStore::new();
        let buckets = Buckets::default();
        store
            .put(&buckets.unlabeled, "ana/unlabeled_dataset.parquet.gzip", bytes)
            .await
            .unwrap();
        let corpus = table(json!([{"article_id": "2", "sentiment": "Neutral"}]));
        write_table(&store, &buckets.processed, "ana/processed_labeled_dataset.parquet.gzip", &corpus)
            .await
            .unwrap();

        let pending = get_unlabeled(&store, &buckets, "ana").await.unwrap();
        assert_eq!(ids(&pending), vec!["1", "3"]);
        assert_eq!(pending.columns(), ["article_id", "title"]);
        assert_eq!(pending.rows()[1]["title"], "c");
    }
}
