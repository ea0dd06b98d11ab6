//! Upstream API rate-limit tracking.
//!
//! Reads `X-RateLimit-Remaining` / `X-RateLimit-Reset` (or the standardised
//! `RateLimit-Remaining` / `RateLimit-Reset`) from forge API responses.  The
//! values are only observed and exported; requests are never delayed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared rate-limit state updated after every forge API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Remaining API calls before the rate limit resets.
    remaining: Arc<AtomicU64>,
    /// Unix timestamp at which the rate limit window resets.
    reset_at: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current remaining calls, or `None` if no response has reported it yet.
    pub fn remaining(&self) -> Option<u64> {
        match self.remaining.load(Ordering::Relaxed) {
            u64::MAX => None,
            r => Some(r),
        }
    }

    /// Update state from HTTP response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let remaining = header_u64(headers, "X-RateLimit-Remaining", "RateLimit-Remaining");
        let reset = header_u64(headers, "X-RateLimit-Reset", "RateLimit-Reset");

        if let Some(r) = remaining {
            self.remaining.store(r, Ordering::Relaxed);
        }
        if let Some(r) = reset {
            self.reset_at.store(r, Ordering::Relaxed);
        }
    }

    /// `true` once the upstream has reported zero remaining calls.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Seconds until the rate-limit window resets, or 0 if already reset.
    pub fn retry_after_secs(&self) -> u64 {
        let reset = self.reset_at.load(Ordering::Relaxed);
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        reset.saturating_sub(now)
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str, fallback: &str) -> Option<u64> {
    headers
        .get(name)
        .or_else(|| headers.get(fallback))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
