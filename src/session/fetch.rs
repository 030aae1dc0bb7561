use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::assignment::get_unlabeled;
use crate::environment::Buckets;
use crate::labels::Article;
use crate::storage::ObjectStore;
use crate::table::{decode_json_table, Table};
use crate::api::API_KEY_HEADER;
use crate::{TARGET_SESSION, TARGET_WEB_REQUEST};

/// Where a session gets its assigned articles from.
pub enum WorkSource<'a> {
    /// A running work-assignment endpoint.
    Remote {
        client: &'a reqwest::Client,
        url: &'a str,
        api_key: Option<&'a str>,
    },
    /// The stores directly, computing the assignment in-process.
    Store {
        store: &'a dyn ObjectStore,
        buckets: &'a Buckets,
    },
}

/// Retrieves the articles still owed by `username`.
pub async fn fetch_work(source: &WorkSource<'_>, username: &str) -> Result<Vec<Article>> {
    let table = match source {
        WorkSource::Remote {
            client,
            url,
            api_key,
        } => fetch_remote_table(client, url, *api_key, username).await?,
        WorkSource::Store { store, buckets } => get_unlabeled(*store, buckets, username)
            .await
            .with_context(|| format!("computing unlabeled data for {}", username))?,
    };

    let articles: Vec<Article> = table
        .to_records()
        .context("assigned data is not a table of articles")?;
    info!(target: TARGET_SESSION, "Retrieved {} articles for {}", articles.len(), username);
    Ok(articles)
}

/// Like [`fetch_work`], but any failure leaves the session with nothing to
/// annotate. The error is returned alongside for display.
pub async fn fetch_work_or_empty(
    source: &WorkSource<'_>,
    username: &str,
) -> (Vec<Article>, Option<anyhow::Error>) {
    match fetch_work(source, username).await {
        Ok(articles) => (articles, None),
        Err(e) => {
            warn!(target: TARGET_SESSION, "An error occurred retrieving the data: {:#}", e);
            (Vec::new(), Some(e))
        }
    }
}

async fn fetch_remote_table(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    username: &str,
) -> Result<Table> {
    info!(target: TARGET_WEB_REQUEST, "Requesting unlabeled data for {} from {}", username, url);

    let mut request = client.post(url).json(&json!({ "username": username }));
    if let Some(key) = api_key {
        request = request.header(API_KEY_HEADER, key);
    }

    let response = request.send().await.context("work-assignment request failed")?;
    let status = response.status();
    let body = response.bytes().await.context("reading work-assignment response")?;
    if !status.is_success() {
        return Err(anyhow!(
            "work-assignment endpoint returned {}: {}",
            status,
            String::from_utf8_lossy(&body)
        ));
    }

    Ok(decode_json_table(&body)?)
}
