//! Forge backend abstraction layer.
//!
//! Provides the [`ForgeBackend`] trait that encapsulates the upstream API
//! calls a refresh cycle needs: the repository index and the per-repository
//! language breakdown.  No URL construction or response parsing leaks outside
//! this module.

pub mod github;
pub mod rate_limit;

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Upstream payloads
// ---------------------------------------------------------------------------

/// One entry of the repository index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositorySummary {
    pub name: String,
    pub full_name: String,
    pub owner: OwnerSummary,
    /// API URL of the repository; its languages live under `{url}/languages`.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OwnerSummary {
    pub login: String,
}

/// Language name (as reported upstream) to size in bytes.
pub type LanguageBreakdown = HashMap<String, u64>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("unexpected status {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Read-only access to the upstream forge API.
#[async_trait::async_trait]
pub trait ForgeBackend: Send + Sync {
    /// Fetch the repository index.
    async fn list_repositories(&self) -> Result<Vec<RepositorySummary>, FetchError>;

    /// Fetch the language breakdown of one repository.
    async fn repository_languages(
        &self,
        repository: &RepositorySummary,
    ) -> Result<LanguageBreakdown, FetchError>;
}
