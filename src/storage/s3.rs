use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{Client, Config};
use tracing::{debug, info};

use super::{ObjectStore, StorageError};
use crate::environment::S3Settings;
use crate::TARGET_STORAGE;

/// Amazon S3, or any S3-compatible endpoint.
#[derive(Clone, Debug)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        S3Store { client }
    }

    /// Builds a client from explicit keys when configured, otherwise from the
    /// default AWS provider chain.
    pub async fn from_settings(settings: &S3Settings) -> Self {
        let region = Region::new(settings.region.clone());

        let config = match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(access_key), Some(secret_key)) => {
                info!(target: TARGET_STORAGE, "Using configured S3 access key in {}", settings.region);
                let creds = Credentials::new(access_key, secret_key, None, None, "annotator");
                let mut builder = Config::builder()
                    .region(region)
                    .credentials_provider(creds)
                    .behavior_version(BehaviorVersion::latest());
                if let Some(endpoint) = &settings.endpoint_url {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                builder.build()
            }
            _ => {
                info!(target: TARGET_STORAGE, "Using default AWS credential chain in {}", settings.region);
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                let mut builder = aws_sdk_s3::config::Builder::from(&shared);
                if let Some(endpoint) = &settings.endpoint_url {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                builder.build()
            }
        };

        S3Store::new(Client::from_conf(config))
    }
}

fn backend_error<E, R>(action: &str, bucket: &str, key: &str, err: SdkError<E, R>) -> StorageError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    StorageError::Backend(format!(
        "{} {}/{} failed: {}",
        action,
        bucket,
        key,
        DisplayErrorContext(err)
    ))
}

fn is_missing_object<R>(err: &SdkError<GetObjectError, R>) -> bool {
    err.as_service_error()
        .is_some_and(|service_error| service_error.is_no_such_key())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(e) if is_missing_object(&e) => {
                return Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(backend_error("get", bucket, key, e)),
        };

        let body = output.body.collect().await.map_err(|e| {
            StorageError::Backend(format!("reading body of {}/{} failed: {}", bucket, key, e))
        })?;
        let bytes = body.into_bytes().to_vec();
        debug!(target: TARGET_STORAGE, "Fetched {} bytes from s3://{}/{}", bytes.len(), bucket, key);
        Ok(bytes)
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/vnd.apache.parquet")
            .send()
            .await
            .map_err(|e| backend_error("put", bucket, key, e))?;
        debug!(target: TARGET_STORAGE, "Uploaded {} bytes to s3://{}/{}", size, bucket, key);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| backend_error("list", bucket, prefix, e))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        debug!(target: TARGET_STORAGE, "Listed {} objects under s3://{}/{}", keys.len(), bucket, prefix);
        Ok(keys)
    }
}
