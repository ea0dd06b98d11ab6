//! Whole-response memoization for the data routes.
//!
//! Responses are keyed by the request URI exactly as received (path and
//! query string, order-sensitive).  A hit replays the stored status, headers
//! and body and adds `X-From-Cache: True`.  A miss runs the handler, and its
//! response is stored with the store's default TTL when the handler did not
//! fail and the status is below 300.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::metrics::MetricsRegistry;
use crate::model::{CacheValue, SharedStore};
use crate::store::Expiry;

const FROM_CACHE_HEADER: &str = "x-from-cache";

/// Response extension set by handlers that failed.  Tagged responses are
/// passed through but never cached, whatever their status.
#[derive(Debug, Clone, Copy)]
pub struct HandlerFailed;

// ---------------------------------------------------------------------------
// CachedResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    /// Header name to raw values, in emission order.
    pub headers: BTreeMap<String, Vec<Bytes>>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Copy a response's status, headers and body.
    ///
    /// `Content-Length` and `Transfer-Encoding` are left out; the server
    /// recomputes body framing on replay.
    pub fn capture(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut captured: BTreeMap<String, Vec<Bytes>> = BTreeMap::new();
        for (name, value) in headers {
            if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
                continue;
            }
            captured
                .entry(name.as_str().to_owned())
                .or_default()
                .push(Bytes::copy_from_slice(value.as_bytes()));
        }

        Self {
            status: status.as_u16(),
            headers: captured,
            body,
        }
    }

    /// Rebuild the response, marked as served from cache.
    pub fn replay(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let headers = response.headers_mut();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_maybe_shared(value.clone()) {
                    headers.append(name.clone(), value);
                }
            }
        }
        headers.append(FROM_CACHE_HEADER, HeaderValue::from_static("True"));
        response
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// State of the [`cache_responses`] middleware.
#[derive(Clone)]
pub struct ResponseCache {
    store: SharedStore,
    metrics: MetricsRegistry,
}

impl ResponseCache {
    pub fn new(store: SharedStore, metrics: MetricsRegistry) -> Self {
        Self { store, metrics }
    }
}

/// Axum middleware serving and populating the response cache.
///
/// Attach with `axum::middleware::from_fn_with_state`.
pub async fn cache_responses(
    State(cache): State<ResponseCache>,
    request: Request,
    next: Next,
) -> Response {
    let key = request.uri().to_string();

    match cache.store.read(&key).await {
        Ok(Some(CacheValue::Response(cached))) => {
            cache.metrics.metrics.response_cache_hits.inc();
            debug!(%key, "response cache hit");
            return cached.replay();
        }
        Ok(Some(CacheValue::Snapshot(_))) => {
            warn!(%key, "snapshot stored under a response key; ignoring");
        }
        Ok(None) => {}
        Err(e) => {
            warn!(%key, error = %e, "response cache read failed; treating as miss");
        }
    }

    cache.metrics.metrics.response_cache_misses.inc();
    debug!(%key, "response cache miss");

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            error!(%key, error = %e, "failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let failed = parts.extensions.get::<HandlerFailed>().is_some();
    if !failed && parts.status.as_u16() < 300 {
        let cached = CachedResponse::capture(parts.status, &parts.headers, body.clone());
        let value = CacheValue::Response(Arc::new(cached));
        if let Err(e) = cache.store.write(&key, value, Expiry::Default).await {
            error!(%key, error = %e, "failed to cache response");
        }
    }

    Response::from_parts(parts, Body::from(body))
}
