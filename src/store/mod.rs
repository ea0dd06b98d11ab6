//! TTL-keyed cache store.
//!
//! Provides the [`Store`] trait shared by the snapshot refresher and the
//! response-caching middleware, with two backends:
//!
//! - [`memory::MemoryStore`]: an in-process map with lazy expiry on read and
//!   a periodic sweep of expired entries.
//! - [`redis::RedisStore`]: Redis / KeyDB via `fred`, with values encoded as
//!   JSON and expiry delegated to the server.

pub mod memory;
pub mod redis;

use std::time::Duration;

use anyhow::Result;

pub use memory::MemoryStore;
pub use redis::RedisStore;

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

/// How long a written entry stays readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiry {
    /// Use the store's configured default TTL.
    #[default]
    Default,
    /// Keep the entry until it is overwritten or the process exits.
    Never,
    /// Expire after the given duration.
    After(Duration),
}

impl Expiry {
    /// Resolve to a concrete TTL, or `None` for entries that never expire.
    pub fn resolve(self, default_ttl: Duration) -> Option<Duration> {
        match self {
            Expiry::Default => Some(default_ttl),
            Expiry::Never => None,
            Expiry::After(ttl) => Some(ttl),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A key/value store whose entries expire.
///
/// Writes replace any existing entry for the key.  Reads only ever observe
/// whole values: an entry is either returned as last written or not at all.
/// The in-process backend never fails; networked backends surface I/O errors
/// through the `Result`.
#[async_trait::async_trait]
pub trait Store<V: Send + 'static>: Send + Sync {
    /// Return the live value for `key`, or `None` if absent or expired.
    async fn read(&self, key: &str) -> Result<Option<V>>;

    /// Store `value` under `key`, replacing any previous entry.
    async fn write(&self, key: &str, value: V, expiry: Expiry) -> Result<()>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
