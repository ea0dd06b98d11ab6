//! In-process [`Store`] backend.
//!
//! Entries live in a [`DashMap`], so reads and writes of a single key are
//! serialized by the shard lock and never observe a half-written entry.
//! Expiry is checked on every read; a background sweep additionally drops
//! expired entries so memory stays bounded when nobody reads them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{Expiry, Store};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry<V> {
    value: V,
    /// `None` means the entry never expires.
    expires_at: Option<Instant>,
    created_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Thread-safe in-memory store with per-entry TTL.
#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: DashMap<String, Entry<V>>,
    default_ttl: Duration,
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty store.  `default_ttl` applies to [`Expiry::Default`]
    /// writes.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Return a clone of the live value for `key`.
    ///
    /// An expired entry found here is removed, unless a concurrent writer
    /// replaced it in the meantime.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
            let lived = now.saturating_duration_since(entry.created_at);
            trace!(key, lived_ms = lived.as_millis() as u64, "cache entry expired");
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Insert `value` under `key`, replacing any existing entry.
    pub fn set(&self, key: &str, value: V, expiry: Expiry) {
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: expiry.resolve(self.default_ttl).map(|ttl| now + ttl),
            created_at: now,
        };
        self.entries.insert(key.to_owned(), entry);
    }

    /// Number of entries physically held, including expired ones that have
    /// not been swept yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Spawn the periodic sweep of expired entries.
    ///
    /// The task holds only a weak reference, so it exits once the store is
    /// dropped, or when `shutdown` is cancelled.  A zero `every` disables the
    /// sweep and returns `None`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if every.is_zero() {
            info!("cache sweep disabled; expiry is enforced on read only");
            return None;
        }

        let store: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(store) = store.upgrade() else {
                    break;
                };
                let evicted = store.purge_expired();
                if evicted > 0 {
                    debug!(evicted, remaining = store.len(), "swept expired cache entries");
                }
            }
            debug!("cache sweeper stopped");
        }))
    }
}

#[async_trait::async_trait]
impl<V> Store<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn read(&self, key: &str) -> Result<Option<V>> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: V, expiry: Expiry) -> Result<()> {
        self.set(key, value, expiry);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
