//! Redis / KeyDB [`Store`] backend.
//!
//! Values are JSON-encoded and written with `SET`, letting the server handle
//! expiry.  Every key is namespaced with the configured prefix so several
//! deployments can share one instance.

use std::marker::PhantomData;
use std::time::Duration;

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::config::RedisConfig;

use super::{Expiry, Store};

// ---------------------------------------------------------------------------
// Pool setup
// ---------------------------------------------------------------------------

/// Create a Redis connection pool from the store configuration.
///
/// The pool is initialised (connected + PING verified) before being returned.
/// If `config.tls` is `true`, the connection uses `rustls` via fred's built-in
/// TLS support.  The auth token is read from the environment variable whose
/// name is given in `config.auth_token_env`.
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(token) = auth_token {
        fred_config.password = Some(token);
    }

    let mut builder = Builder::from_config(fred_config);
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build Redis connection pool")?;

    pool.init().await.context("failed to connect to Redis")?;

    let _: String = pool
        .ping(None)
        .await
        .context("Redis PING failed after connect")?;

    tracing::info!(
        host = host,
        port = port,
        tls = config.tls,
        pool_size = config.pool_size,
        "Redis pool created and verified"
    );

    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a database index).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

// ---------------------------------------------------------------------------
// RedisStore
// ---------------------------------------------------------------------------

/// [`Store`] backed by a shared Redis pool.
pub struct RedisStore<V> {
    pool: Pool,
    key_prefix: String,
    default_ttl: Duration,
    _value: PhantomData<fn() -> V>,
}

impl<V> RedisStore<V> {
    pub fn new(pool: Pool, key_prefix: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            default_ttl,
            _value: PhantomData,
        }
    }

    fn namespaced(&self, key: &str) -> String {
        namespaced_key(&self.key_prefix, key)
    }
}

fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

fn encode_value<V: Serialize>(key: &str, value: &V) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to encode value for {key}"))
}

fn decode_value<V: DeserializeOwned>(key: &str, raw: &str) -> Result<V> {
    serde_json::from_str(raw).with_context(|| format!("failed to decode cached value at {key}"))
}

/// Millisecond TTL for a `SET ... PX`, or `None` for a persistent key.
///
/// Redis rejects `PX 0`, so anything shorter than a millisecond is rounded
/// up to one.
fn expiry_millis(expiry: Expiry, default_ttl: Duration) -> Option<i64> {
    expiry.resolve(default_ttl).map(|ttl| {
        i64::try_from(ttl.as_millis())
            .unwrap_or(i64::MAX)
            .max(1)
    })
}

#[async_trait::async_trait]
impl<V> Store<V> for RedisStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn read(&self, key: &str) -> Result<Option<V>> {
        let key = self.namespaced(key);
        let raw: Option<String> = self
            .pool
            .get(key.as_str())
            .await
            .with_context(|| format!("Redis GET {key} failed"))?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        trace!(%key, bytes = raw.len(), "store hit");
        decode_value(&key, &raw).map(Some)
    }

    async fn write(&self, key: &str, value: V, expiry: Expiry) -> Result<()> {
        let key = self.namespaced(key);
        let encoded = encode_value(&key, &value)?;
        let ttl_ms = expiry_millis(expiry, self.default_ttl);

        let _: () = self
            .pool
            .set(key.as_str(), encoded, ttl_ms.map(Expiration::PX), None, false)
            .await
            .with_context(|| format!("Redis SET {key} failed"))?;
        trace!(%key, ?ttl_ms, "store set");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await.context("Redis PING failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::http::response_cache::CachedResponse;
    use crate::model::{CacheValue, Snapshot};
    use crate::query::fixtures::repository;

    #[test]
    fn keys_carry_the_prefix() {
        assert_eq!(namespaced_key("langstats:", "/repos?limit=2"), "langstats:/repos?limit=2");
        assert_eq!(namespaced_key("", "repositories"), "repositories");
    }

    #[test]
    fn response_value_round_trips_through_json() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let cached = CachedResponse::capture(StatusCode::OK, &headers, Bytes::from_static(b"[1,2]"));
        let value = CacheValue::Response(Arc::new(cached.clone()));

        let raw = encode_value("k", &value).unwrap();
        match decode_value::<CacheValue>("k", &raw).unwrap() {
            CacheValue::Response(decoded) => assert_eq!(*decoded, cached),
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_value_round_trips_through_json() {
        let snapshot = Snapshot {
            repositories: vec![repository("octocat", "hello-world", &[("rust", 1024)])],
            refreshed_at: Utc::now(),
        };
        let raw = encode_value("k", &CacheValue::Snapshot(Arc::new(snapshot.clone()))).unwrap();
        match decode_value::<CacheValue>("k", &raw).unwrap() {
            CacheValue::Snapshot(decoded) => assert_eq!(*decoded, snapshot),
            other => panic!("expected a snapshot, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_payload_is_an_error() {
        let err = decode_value::<CacheValue>("langstats:repositories", "{not json").unwrap_err();
        assert!(err.to_string().contains("langstats:repositories"));
    }

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("cache.internal:6380").unwrap();
        assert_eq!(host, "cache.internal");
        assert_eq!(port, 6380);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("cache.internal").unwrap();
        assert_eq!(host, "cache.internal");
        assert_eq!(port, 6379);
    }

    #[test]
    fn test_parse_host_port_strips_database_index() {
        let (host, port) = parse_host_port("127.0.0.1:6379/2").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 6379);
    }

    #[test]
    fn test_parse_host_port_rejects_bad_port() {
        assert!(parse_host_port("cache.internal:redis").is_err());
    }

    #[test]
    fn expiry_millis_modes() {
        let default_ttl = Duration::from_secs(30);
        assert_eq!(expiry_millis(Expiry::Default, default_ttl), Some(30_000));
        assert_eq!(expiry_millis(Expiry::Never, default_ttl), None);
        assert_eq!(
            expiry_millis(Expiry::After(Duration::from_millis(1500)), default_ttl),
            Some(1500)
        );
    }

    #[test]
    fn expiry_millis_rounds_up_to_one() {
        assert_eq!(
            expiry_millis(Expiry::After(Duration::from_micros(10)), Duration::ZERO),
            Some(1)
        );
        assert_eq!(
            expiry_millis(Expiry::After(Duration::ZERO), Duration::ZERO),
            Some(1)
        );
    }
}
