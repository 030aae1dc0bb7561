use anyhow::{anyhow, Context, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::session::FlushPolicy;
use crate::storage::{LocalStore, ObjectStore, S3Store};
use crate::table::DuplicatePolicy;

/// Bucket names for the three datasets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Buckets {
    pub unlabeled: String,
    pub raw_labeled: String,
    pub processed: String,
}

impl Default for Buckets {
    fn default() -> Self {
        Buckets {
            unlabeled: "unlabeled-news-data".to_string(),
            raw_labeled: "raw-labeled-news-data".to_string(),
            processed: "processed-labeled-news-data".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    S3,
    Local,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s3" => Ok(StoreBackend::S3),
            "local" | "fs" => Ok(StoreBackend::Local),
            other => Err(format!("unknown store backend '{}' (expected 's3' or 'local')", other)),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::S3 => write!(f, "s3"),
            StoreBackend::Local => write!(f, "local"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Settings {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Runtime configuration, read from the environment once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub buckets: Buckets,
    pub backend: StoreBackend,
    pub local_store_path: PathBuf,
    pub s3: S3Settings,
    pub flush_policy: FlushPolicy,
    pub duplicate_policy: DuplicatePolicy,
    pub credentials_path: PathBuf,
    pub api_key: Option<String>,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let string_or = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let defaults = Buckets::default();
        let buckets = Buckets {
            unlabeled: string_or("UNLABELED_BUCKET", &defaults.unlabeled),
            raw_labeled: string_or("RAW_LABELED_BUCKET", &defaults.raw_labeled),
            processed: string_or("PROCESSED_LABELED_BUCKET", &defaults.processed),
        };

        let flush_defaults = FlushPolicy::default();
        let flush_policy = FlushPolicy {
            min_records: parse_or(get("MIN_ANNOTATIONS"), "MIN_ANNOTATIONS", flush_defaults.min_records)?,
            drop_incomplete: match get("DROP_INCOMPLETE") {
                Some(raw) => parse_bool(&raw).context("DROP_INCOMPLETE")?,
                None => flush_defaults.drop_incomplete,
            },
        };

        Ok(Settings {
            buckets,
            backend: parse_or(get("STORE_BACKEND"), "STORE_BACKEND", StoreBackend::S3)?,
            local_store_path: PathBuf::from(string_or("LOCAL_STORE_PATH", "data")),
            s3: S3Settings {
                region: string_or("AWS_REGION", "us-east-1"),
                endpoint_url: get("S3_ENDPOINT_URL"),
                access_key_id: get("AWS_ACCESS_KEY_ID"),
                secret_access_key: get("AWS_SECRET_ACCESS_KEY"),
            },
            flush_policy,
            duplicate_policy: parse_or(get("DUPLICATE_POLICY"), "DUPLICATE_POLICY", DuplicatePolicy::KeepFirst)?,
            credentials_path: PathBuf::from(string_or("CREDENTIALS_PATH", "credentials.yaml")),
            api_key: get("ANNOTATOR_API_KEY"),
            port: parse_or(get("PORT"), "PORT", 8080)?,
        })
    }

    /// Opens the configured object store.
    pub async fn open_store(&self) -> Arc<dyn ObjectStore> {
        match self.backend {
            StoreBackend::S3 => Arc::new(S3Store::from_settings(&self.s3).await),
            StoreBackend::Local => {
                info!("Using local object store at {}", self.local_store_path.display());
                Arc::new(LocalStore::new(self.local_store_path.clone()))
            }
        }
    }
}

fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid value '{}' for {}: {}", raw, name, e)),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got '{}'", other)),
    }
}
