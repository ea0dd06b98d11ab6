//! Data published by the refresher and read by the HTTP handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::http::response_cache::CachedResponse;
use crate::store::{Expiry, Store};

/// Store key under which the current [`Snapshot`] is published.
pub const SNAPSHOT_KEY: &str = "repositories";

/// The store shared by every component.
pub type SharedStore = Arc<dyn Store<CacheValue>>;

// ---------------------------------------------------------------------------
// Repository records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// `owner/name`.
    pub full_name: String,
    /// Login of the owning user or organisation.
    pub owner: String,
    /// Repository name without the owner.
    pub repository: String,
    /// Lowercase language name to size.
    pub languages: BTreeMap<String, Language>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    /// Size of the language in bytes.
    pub bytes: u64,
}

/// All repositories produced by one successful refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub repositories: Vec<Repository>,
    pub refreshed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store payloads
// ---------------------------------------------------------------------------

/// Everything the application keeps in the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheValue {
    Snapshot(Arc<Snapshot>),
    Response(Arc<CachedResponse>),
}

/// Read the currently published snapshot, if any.
pub async fn load_snapshot(store: &dyn Store<CacheValue>) -> Result<Option<Arc<Snapshot>>> {
    match store.read(SNAPSHOT_KEY).await? {
        Some(CacheValue::Snapshot(snapshot)) => Ok(Some(snapshot)),
        Some(CacheValue::Response(_)) => {
            tracing::warn!(key = SNAPSHOT_KEY, "unexpected cached response under snapshot key");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Replace the published snapshot in a single write.
pub async fn publish_snapshot(store: &dyn Store<CacheValue>, snapshot: Snapshot) -> Result<()> {
    store
        .write(
            SNAPSHOT_KEY,
            CacheValue::Snapshot(Arc::new(snapshot)),
            Expiry::Never,
        )
        .await
}
