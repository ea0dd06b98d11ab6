//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET      /repos?language=&owner=&limit=` - Filtered repositories (cached)
//! - `GET      /stats?language=`               - Language statistics (cached)
//! - `GET|POST /ping`                          - Liveness probe
//! - `GET      /healthz`                       - Health check
//! - `GET      /metrics`                       - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use super::response_cache::{cache_responses, HandlerFailed, ResponseCache};
use crate::model::{load_snapshot, Snapshot};
use crate::query::{build_stats, filter_repositories, FilterConfig};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let response_cache = ResponseCache::new(Arc::clone(&state.store), state.metrics.clone());

    Router::new()
        // Data routes, memoized by the response cache
        .route("/repos", get(handle_repos))
        .route("/stats", get(handle_stats))
        .route_layer(middleware::from_fn_with_state(response_cache, cache_responses))
        // Probes and metrics
        .route("/ping", get(handle_ping).post(handle_ping))
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReposQuery {
    language: Option<String>,
    owner: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    language: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /repos`
#[instrument(skip(state))]
async fn handle_repos(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReposQuery>,
) -> Result<Response, AppError> {
    let filter = FilterConfig::new()
        .with_language(query.language.unwrap_or_default())
        .with_owner(query.owner.unwrap_or_default())
        .with_limit_str(query.limit.as_deref().unwrap_or_default());

    let snapshot = current_snapshot(&state).await;
    let repositories = snapshot
        .as_deref()
        .map(|s| s.repositories.as_slice())
        .unwrap_or_default();

    let filtered = filter_repositories(&filter, repositories);
    debug!(matched = filtered.len(), "repositories filtered");
    json_response(&filtered)
}

/// `GET /stats`
///
/// Without a `language` parameter the configured fallback language is used.
#[instrument(skip(state))]
async fn handle_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Response, AppError> {
    let language = query
        .language
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| state.config.stats.fallback_language.clone());

    let snapshot = current_snapshot(&state).await;
    let repositories = snapshot
        .as_deref()
        .map(|s| s.repositories.as_slice())
        .unwrap_or_default();

    json_response(&build_stats(repositories, &language))
}

/// `GET|POST /ping`
async fn handle_ping() -> &'static str {
    "pong"
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the service.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// The published snapshot, or `None` when there is none yet or it cannot be
/// read.  Queries then answer with empty results.
async fn current_snapshot(state: &AppState) -> Option<Arc<Snapshot>> {
    match load_snapshot(state.store.as_ref()).await {
        Ok(Some(snapshot)) => Some(snapshot),
        Ok(None) => {
            debug!("no snapshot published yet");
            None
        }
        Err(e) => {
            warn!(error = %e, "failed to read snapshot; serving empty results");
            None
        }
    }
}

fn json_response<T: Serialize + ?Sized>(value: &T) -> Result<Response, AppError> {
    let body = serde_json::to_vec(value).map_err(AppError::Encode)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Every error response carries the [`HandlerFailed`] extension so the
/// response cache never stores it.
#[derive(Debug)]
pub enum AppError {
    /// An unexpected internal error.
    Internal(anyhow::Error),
    /// The response body could not be serialized.
    Encode(serde_json::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut response = match self {
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
            AppError::Encode(err) => {
                error!(error = %err, "failed to encode JSON response");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to encode response",
                )
                    .into_response()
            }
        };
        response.extensions_mut().insert(HandlerFailed);
        response
    }
}
