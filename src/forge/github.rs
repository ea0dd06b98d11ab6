//! GitHub REST API backend.
//!
//! Every call carries the bearer token and the pinned API version, holds one
//! permit of the shared connection semaphore for its whole duration, and is
//! bounded by the configured per-request timeout (permit wait included).

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::metrics::{Endpoint, MetricsRegistry};

use super::rate_limit::RateLimitState;
use super::{FetchError, ForgeBackend, LanguageBreakdown, RepositorySummary};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

pub struct GitHubBackend {
    http_client: reqwest::Client,
    api_url: String,
    api_version: String,
    token: Option<String>,
    /// Caps simultaneous requests to the upstream host.
    connections: Semaphore,
    request_timeout: Duration,
    rate_limit: RateLimitState,
    metrics: MetricsRegistry,
}

impl GitHubBackend {
    pub fn new(
        upstream: &UpstreamConfig,
        token: Option<String>,
        http_client: reqwest::Client,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            http_client,
            api_url: upstream.api_url.trim_end_matches('/').to_string(),
            api_version: upstream.api_version.clone(),
            token,
            connections: Semaphore::new(upstream.max_connections),
            request_timeout: upstream.request_timeout(),
            rate_limit: RateLimitState::new(),
            metrics,
        }
    }

    /// GET `url` and decode its JSON body, bounded by the request timeout.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        endpoint: Endpoint,
    ) -> Result<T, FetchError> {
        match tokio::time::timeout(self.request_timeout, self.fetch_json(url, endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: url.to_string(),
                timeout: self.request_timeout,
            }),
        }
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        endpoint: Endpoint,
    ) -> Result<T, FetchError> {
        // The semaphore is never closed, so acquiring cannot fail.
        let _permit = self.connections.acquire().await;

        let mut request = self
            .http_client
            .get(url)
            .header(ACCEPT, GITHUB_ACCEPT)
            .header(API_VERSION_HEADER, &self.api_version);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

        self.metrics.metrics.record_upstream_call(endpoint);
        self.rate_limit.update_from_headers(resp.headers());
        if let Some(remaining) = self.rate_limit.remaining() {
            self.metrics
                .metrics
                .upstream_api_rate_limit_remaining
                .set(i64::try_from(remaining).unwrap_or(i64::MAX));
        }

        let status = resp.status();
        if !status.is_success() {
            let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
                || (status == StatusCode::FORBIDDEN && self.rate_limit.is_exhausted());
            if rate_limited {
                warn!(
                    %url,
                    %status,
                    retry_after_secs = self.rate_limit.retry_after_secs(),
                    "upstream API rate limit exhausted"
                );
            } else {
                warn!(%url, %status, "upstream API returned non-success status");
            }
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let body = resp.bytes().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;
        debug!(%url, bytes = body.len(), "upstream response received");

        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ForgeBackend for GitHubBackend {
    async fn list_repositories(&self) -> Result<Vec<RepositorySummary>, FetchError> {
        let url = format!("{}/repositories", self.api_url);
        self.get_json(&url, Endpoint::Repositories).await
    }

    async fn repository_languages(
        &self,
        repository: &RepositorySummary,
    ) -> Result<LanguageBreakdown, FetchError> {
        let url = format!("{}/languages", repository.url.trim_end_matches('/'));
        self.get_json(&url, Endpoint::Languages).await
    }
}
