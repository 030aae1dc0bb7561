//! Object key layout shared by the stores.
//!
//! Every object lives under a `{username}/` prefix so a user's batches can
//! be listed on their own.

use chrono::{DateTime, Utc};

pub const UNLABELED_OBJECT: &str = "unlabeled_dataset.parquet.gzip";
pub const PROCESSED_OBJECT: &str = "processed_labeled_dataset.parquet.gzip";
pub const RAW_BATCH_PREFIX: &str = "raw_labeled_data_";
pub const RAW_BATCH_SUFFIX: &str = ".parquet.gzip";

/// Sorts lexicographically in chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S%.3f";

pub fn user_prefix(username: &str) -> String {
    format!("{}/", username)
}

pub fn unlabeled_key(username: &str) -> String {
    format!("{}/{}", username, UNLABELED_OBJECT)
}

pub fn processed_key(username: &str) -> String {
    format!("{}/{}", username, PROCESSED_OBJECT)
}

pub fn raw_batch_key(username: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}{}{}",
        username,
        RAW_BATCH_PREFIX,
        at.format(TIMESTAMP_FORMAT),
        RAW_BATCH_SUFFIX
    )
}

/// Usernames become the first path segment of every key.
pub fn is_valid_username(username: &str) -> bool {
    !username.trim().is_empty()
        && username != "."
        && username != ".."
        && !username.contains(['/', '\\'])
}

/// Owner of an object: the first segment of its key.
pub fn username_from_key(key: &str) -> Option<&str> {
    let (first, _) = key.split_once('/')?;
    is_valid_username(first).then_some(first)
}

/// Decodes a key as delivered in storage-change notifications, where spaces
/// arrive as `+` and reserved characters percent-encoded.
pub fn decode_event_key(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(name, value)| {
            if value.is_empty() {
                name.into_owned()
            } else {
                format!("{}={}", name, value)
            }
        })
        .collect::<Vec<String>>()
        .join("&")
}
