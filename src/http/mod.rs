//! HTTP layer.
//!
//! This module provides the axum-based HTTP server that answers repository
//! and statistics queries from the published snapshot, memoizes those
//! responses in the shared store, and exposes probes and metrics.

pub mod handler;
pub mod response_cache;
