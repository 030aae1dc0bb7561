//! Object storage for unlabeled pools, raw labeled batches and reconciled
//! corpora.
//!
//! The functions only need three primitives (get, put, list by prefix),
//! so backends are interchangeable: S3 in production, a directory tree for
//! offline work and an in-memory map for tests.

pub mod keys;
mod local;
mod memory;
mod s3;

pub use self::local::LocalStore;
pub use self::memory::MemoryStore;
pub use self::s3::S3Store;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::table::{decode_parquet, encode_parquet, CodecError, Table};
use crate::TARGET_STORAGE;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("local store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object {bucket}/{key} could not be decoded: {source}")]
    Corrupt {
        bucket: String,
        key: String,
        #[source]
        source: CodecError,
    },
    #[error("table could not be encoded: {0}")]
    Encode(#[source] CodecError),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Writes `body`, replacing any existing object under `key`.
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError>;

    /// Keys under `prefix`, sorted lexicographically.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Fetches and decodes a stored table.
pub async fn read_table(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> Result<Table, StorageError> {
    let bytes = store.get(bucket, key).await?;
    let table = decode_parquet(bytes.into()).map_err(|source| StorageError::Corrupt {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    })?;
    debug!(target: TARGET_STORAGE, "Read {} rows from {}/{}", table.len(), bucket, key);
    Ok(table)
}

/// Like [`read_table`], but a missing object is `None`.
pub async fn read_table_if_exists(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> Result<Option<Table>, StorageError> {
    match read_table(store, bucket, key).await {
        Ok(table) => Ok(Some(table)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn write_table(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    table: &Table,
) -> Result<(), StorageError> {
    let bytes = encode_parquet(table).map_err(StorageError::Encode)?;
    store.put(bucket, key, bytes).await?;
    debug!(target: TARGET_STORAGE, "Wrote {} rows to {}/{}", table.len(), bucket, key);
    Ok(())
}
