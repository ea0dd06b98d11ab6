use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::model::{load_snapshot, CacheValue};
use crate::store::Store;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub snapshot: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_store(store: &dyn Store<CacheValue>) -> CheckResult {
    match store.health_check().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("store unreachable: {e:#}")),
    }
}

async fn check_snapshot(store: &dyn Store<CacheValue>) -> CheckResult {
    match load_snapshot(store).await {
        Ok(Some(snapshot)) => CheckResult {
            ok: true,
            detail: Some(format!(
                "{} repositories, refreshed at {}",
                snapshot.repositories.len(),
                snapshot.refreshed_at.to_rfc3339()
            )),
        },
        Ok(None) => CheckResult::unhealthy("no snapshot published yet"),
        Err(e) => CheckResult::unhealthy(format!("snapshot read failed: {e:#}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.store.ok {
        // Nothing can be served or cached without the store.
        HealthStatus::Unhealthy
    } else if !checks.snapshot.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.store.as_ref();
    let (store_check, snapshot) = tokio::join!(check_store(store), check_snapshot(store));

    let checks = HealthChecks {
        store: store_check,
        snapshot,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
