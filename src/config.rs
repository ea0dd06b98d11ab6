use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:5000`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:5000".to_string()
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL to the upstream API root (e.g. `https://api.github.com`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Name of the environment variable that holds the upstream token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Value sent in the `X-GitHub-Api-Version` header.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Maximum number of simultaneous requests against the upstream host.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Deadline (seconds) applied independently to every upstream call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
            api_version: default_api_version(),
            max_connections: default_max_connections(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_api_version() -> String {
    "2022-11-28".to_string()
}

fn default_max_connections() -> usize {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("langstats/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Refresh schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Interval (seconds) between snapshot refresh cycles.  The first cycle
    /// runs immediately at startup.
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_refresh_interval() -> u64 {
    3 * 60 * 60
}

// ---------------------------------------------------------------------------
// Cache store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map.  Contents are lost on restart.
    #[default]
    Memory,
    /// Redis / KeyDB via `fred`.
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// TTL (seconds) applied to writes that ask for the store default.
    /// Cached HTTP responses use this.
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,
    /// Interval (seconds) of the expired-entry sweep for the memory backend.
    /// `0` disables the sweep; expiry is then only enforced on read.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            default_ttl_secs: default_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
            redis: RedisConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_ttl() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    #[serde(default = "default_redis_endpoint")]
    pub endpoint: String,
    /// Enable TLS for the connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the Redis auth token.
    #[serde(default = "default_redis_auth_env")]
    pub auth_token_env: String,
    /// Prefix prepended to every key written by this process.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_redis_endpoint(),
            tls: false,
            auth_token_env: default_redis_auth_env(),
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_redis_endpoint() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_auth_env() -> String {
    "REDIS_AUTH_TOKEN".to_string()
}

fn default_key_prefix() -> String {
    "langstats:".to_string()
}

fn default_pool_size() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Language reported by `/stats` when the request names none.
    #[serde(default = "default_fallback_language")]
    pub fallback_language: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            fallback_language: default_fallback_language(),
        }
    }
}

fn default_fallback_language() -> String {
    "ruby".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserializes to `()` rather than a mapping.
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.refresh.interval_secs > 0,
        "refresh.interval_secs must be greater than 0"
    );
    anyhow::ensure!(
        config.upstream.max_connections > 0,
        "upstream.max_connections must be greater than 0"
    );
    anyhow::ensure!(
        config.upstream.request_timeout_secs > 0,
        "upstream.request_timeout_secs must be greater than 0"
    );
    anyhow::ensure!(
        config.store.default_ttl_secs > 0,
        "store.default_ttl_secs must be greater than 0"
    );
    anyhow::ensure!(
        !config.stats.fallback_language.is_empty(),
        "stats.fallback_language must not be empty"
    );
    if config.store.backend == StoreBackend::Redis {
        anyhow::ensure!(
            config.store.redis.pool_size > 0,
            "store.redis.pool_size must be greater than 0"
        );
    }
    Ok(())
}
