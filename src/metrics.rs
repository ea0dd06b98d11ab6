use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshLabels {
    pub outcome: RefreshOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RefreshOutcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    Repositories,
    Languages,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- refresh --
    pub refresh_cycles_total: Family<RefreshLabels, Counter>,
    pub refresh_duration_seconds: Histogram,
    pub snapshot_repositories: Gauge,

    // -- upstream API --
    pub upstream_api_calls: Family<EndpointLabels, Counter>,
    pub upstream_api_rate_limit_remaining: Gauge,

    // -- response cache --
    pub response_cache_hits: Counter,
    pub response_cache_misses: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let refresh_cycles_total = Family::<RefreshLabels, Counter>::default();
        registry.register(
            "langstats_refresh_cycles",
            "Snapshot refresh cycles by outcome",
            refresh_cycles_total.clone(),
        );

        let refresh_duration_seconds = Histogram::new(exponential_buckets(0.1, 2.0, 12));
        registry.register(
            "langstats_refresh_duration_seconds",
            "Snapshot refresh cycle latency in seconds",
            refresh_duration_seconds.clone(),
        );

        let snapshot_repositories: Gauge = Gauge::default();
        registry.register(
            "langstats_snapshot_repositories",
            "Number of repositories in the published snapshot",
            snapshot_repositories.clone(),
        );

        let upstream_api_calls = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "langstats_upstream_api_calls",
            "Upstream API call count by endpoint",
            upstream_api_calls.clone(),
        );

        let upstream_api_rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "langstats_upstream_api_rate_limit_remaining",
            "Remaining upstream API calls before rate limit",
            upstream_api_rate_limit_remaining.clone(),
        );

        let response_cache_hits = Counter::default();
        registry.register(
            "langstats_response_cache_hits",
            "Responses served from the response cache",
            response_cache_hits.clone(),
        );

        let response_cache_misses = Counter::default();
        registry.register(
            "langstats_response_cache_misses",
            "Responses computed by a handler",
            response_cache_misses.clone(),
        );

        Self {
            refresh_cycles_total,
            refresh_duration_seconds,
            snapshot_repositories,
            upstream_api_calls,
            upstream_api_rate_limit_remaining,
            response_cache_hits,
            response_cache_misses,
        }
    }

    pub fn record_refresh(&self, outcome: RefreshOutcome) {
        self.refresh_cycles_total
            .get_or_create(&RefreshLabels { outcome })
            .inc();
    }

    pub fn record_upstream_call(&self, endpoint: Endpoint) {
        self.upstream_api_calls
            .get_or_create(&EndpointLabels { endpoint })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
