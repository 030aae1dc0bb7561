//! HTTP surface for the two data functions.
//!
//! * `POST /get-unlabeled-data` with `{"username": ...}` returns the user's
//!   pending articles as a JSON array of rows.
//! * `POST /concatenate` takes an S3 storage-change notification and
//!   reconciles every user it names.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::assignment::get_unlabeled;
use crate::environment::Buckets;
use crate::reconcile::{ReconcileError, Reconciler, StorageEvent};
use crate::storage::keys::is_valid_username;
use crate::storage::ObjectStore;
use crate::table::encode_rows;
use crate::TARGET_WEB_REQUEST;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub buckets: Buckets,
    pub reconciler: Arc<Reconciler>,
    pub api_key: Option<String>,
}

#[derive(Deserialize)]
struct UnlabeledRequest {
    username: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_check).post(status_check))
        .route("/get-unlabeled-data", post(get_unlabeled_data))
        .route("/concatenate", post(concatenate))
        .with_state(state)
}

/// Binds to `0.0.0.0:{port}` and serves until the process is stopped.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("Server running on http://{}", addr);

    axum::serve(listener, router(state).into_make_service())
        .await
        .context("server terminated")?;

    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        warn!(target: TARGET_WEB_REQUEST, "Rejected request with missing or invalid API key");
        Err(error_response(StatusCode::UNAUTHORIZED, "invalid API key"))
    }
}

async fn status_check() -> &'static str {
    "OK"
}

async fn get_unlabeled_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = check_api_key(&state, &headers) {
        return rejection;
    }

    let request: UnlabeledRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(target: TARGET_WEB_REQUEST, "Invalid get-unlabeled-data body: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "expected {\"username\": string}");
        }
    };
    if !is_valid_username(&request.username) {
        return error_response(StatusCode::BAD_REQUEST, "invalid username");
    }

    info!(target: TARGET_WEB_REQUEST, "get-unlabeled-data for {}", request.username);
    let pending = match get_unlabeled(state.store.as_ref(), &state.buckets, &request.username).await {
        Ok(pending) => pending,
        Err(e) => {
            error!(target: TARGET_WEB_REQUEST, "get-unlabeled-data for {} failed: {}", request.username, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to retrieve data");
        }
    };

    match encode_rows(&pending) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            error!(target: TARGET_WEB_REQUEST, "Encoding unlabeled data failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode data")
        }
    }
}

async fn concatenate(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(rejection) = check_api_key(&state, &headers) {
        return rejection;
    }

    let event: StorageEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(target: TARGET_WEB_REQUEST, "Invalid storage notification: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "expected a storage notification");
        }
    };

    match state.reconciler.handle_event(&event).await {
        Ok(reports) => {
            let rows_processed: usize = reports.iter().map(|r| r.rows_processed).sum();
            info!(
                target: TARGET_WEB_REQUEST,
                "concatenate processed {} rows for {} users",
                rows_processed,
                reports.len()
            );
            Json(json!({ "rows_processed": rows_processed, "users": reports })).into_response()
        }
        Err(e @ (ReconcileError::InvalidKey(_) | ReconcileError::EmptyNotification)) => {
            warn!(target: TARGET_WEB_REQUEST, "Rejected storage notification: {}", e);
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e) => {
            error!(target: TARGET_WEB_REQUEST, "concatenate failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "reconciliation failed")
        }
    }
}
