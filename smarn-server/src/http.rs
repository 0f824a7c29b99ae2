//! smarn HTTP API
//!
//! Axum-based HTTP server that exposes screenshot search over HTTP for the
//! CLI and any other frontend.
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, serde_json::Value)`, testable without axum.
//!
//! Endpoints:
//! - GET    /health      — store and embedding backend status
//! - GET    /version     — server version info
//! - GET    /search      — text search (`query` or `text_query`, optional `k`)
//! - DELETE /screenshots — remove every stored entry

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use smarn_core::db::VectorStore;
use smarn_core::embeddings::EmbeddingBackend;
use smarn_core::SmarnConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::subsystems::retrieve::search_screenshots;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub store: VectorStore,
    pub backend: Arc<dyn EmbeddingBackend>,
    pub config: SmarnConfig,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/search", get(search_handler))
        .route("/screenshots", delete(purge_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: HttpState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(Arc::new(state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("smarn HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

/// `GET /search` query string. `k` stays a string so a malformed value
/// falls back to the default instead of rejecting the request.
#[derive(Debug, Deserialize, Default)]
pub struct SearchParams {
    pub query: Option<String>,
    pub text_query: Option<String>,
    pub k: Option<String>,
}

impl SearchParams {
    pub fn query_text(&self) -> &str {
        self.query
            .as_deref()
            .or(self.text_query.as_deref())
            .unwrap_or("")
    }

    pub fn parsed_k(&self) -> Option<usize> {
        self.k.as_deref().and_then(|k| k.trim().parse().ok())
    }
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    fn into_value(self) -> serde_json::Value {
        serde_json::json!({
            "error": self.error,
            "status": self.status,
        })
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — counts stored entries and reports the backend.
pub async fn health_inner(
    store: &VectorStore,
    backend: &dyn EmbeddingBackend,
) -> (StatusCode, serde_json::Value) {
    let entries = match store.count().await {
        Ok(n) => n,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "entries": entries,
            "database": store.path().display().to_string(),
            "embedding_backend": backend.name(),
            "dimensions": backend.dimensions(),
        }),
    )
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "smarn/1",
    })
}

/// Inner search — returns the hit list, `[]` for a blank query.
pub async fn search_inner(
    store: &VectorStore,
    backend: &dyn EmbeddingBackend,
    config: &SmarnConfig,
    params: SearchParams,
) -> (StatusCode, serde_json::Value) {
    let start = Instant::now();

    let result = search_screenshots(
        params.query_text(),
        params.parsed_k(),
        store,
        backend,
        &config.retrieval,
    )
    .await;

    match result {
        Ok(hits) => {
            tracing::debug!(took_ms = start.elapsed().as_millis() as u64, "Search served");
            match serde_json::to_value(hits) {
                Ok(body) => (StatusCode::OK, body),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new(e.to_string()).into_value(),
                ),
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Search failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new(e.to_string()).into_value(),
            )
        }
    }
}

/// Inner purge — deletes every entry, reports how many were removed.
pub async fn purge_inner(store: &VectorStore) -> (StatusCode, serde_json::Value) {
    match store.purge_all().await {
        Ok(purged) => (StatusCode::OK, serde_json::json!({ "purged": purged })),
        Err(e) => {
            tracing::error!(error = %e, "Purge failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new(e.to_string()).into_value(),
            )
        }
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.store, state.backend.as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn search_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    let (status, body) =
        search_inner(&state.store, state.backend.as_ref(), &state.config, params).await;
    (status, Json(body))
}

pub async fn purge_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = purge_inner(&state.store).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests
// ============================================================================
