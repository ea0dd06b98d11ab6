mod config;
mod forge;
mod health;
mod http;
mod metrics;
mod model;
mod query;
mod refresh;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, StoreBackend, StoreConfig};
use crate::forge::github::GitHubBackend;
use crate::forge::ForgeBackend;
use crate::metrics::MetricsRegistry;
use crate::model::{CacheValue, SharedStore};
use crate::refresh::Refresher;
use crate::store::{MemoryStore, RedisStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "langstats", about = "GitHub repository language statistics service")]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults apply when
    /// omitted.
    #[arg(short, long)]
    config: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Holds the published snapshot and cached responses.
    pub store: SharedStore,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Store setup
// ---------------------------------------------------------------------------

async fn build_store(config: &StoreConfig, shutdown: &CancellationToken) -> Result<SharedStore> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::<CacheValue>::new(config.default_ttl()));
            let _sweeper = store.spawn_sweeper(config.cleanup_interval(), shutdown.clone());
            tracing::info!(
                default_ttl_secs = config.default_ttl_secs,
                cleanup_interval_secs = config.cleanup_interval_secs,
                "in-memory store initialised"
            );
            Ok(store)
        }
        StoreBackend::Redis => {
            let pool = store::redis::create_pool(&config.redis).await?;
            Ok(Arc::new(RedisStore::<CacheValue>::new(
                pool,
                config.redis.key_prefix.clone(),
                config.default_ttl(),
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for SIGINT or SIGTERM, then cancel `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
        () = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = cli.config.as_deref().unwrap_or("<defaults>"),
        "starting langstats"
    );

    let shutdown = CancellationToken::new();

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Store ----
    let store = build_store(&config.store, &shutdown).await?;

    // ---- Forge backend ----
    let token = std::env::var(&config.upstream.token_env)
        .ok()
        .filter(|t| !t.is_empty());
    if token.is_none() {
        tracing::warn!(
            env = %config.upstream.token_env,
            "no upstream token set; API calls are unauthenticated"
        );
    }

    let http_client = reqwest::Client::builder()
        .user_agent(config.upstream.user_agent.as_str())
        .pool_max_idle_per_host(config.upstream.max_connections)
        .build()
        .context("failed to build reqwest client")?;

    let forge: Arc<dyn ForgeBackend> = Arc::new(GitHubBackend::new(
        &config.upstream,
        token,
        http_client,
        metrics.clone(),
    ));
    tracing::info!(
        api_url = %config.upstream.api_url,
        max_connections = config.upstream.max_connections,
        "forge backend initialised"
    );

    let refresher = Arc::new(Refresher::new(forge, Arc::clone(&store), metrics.clone()));

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        metrics,
    });

    // ---- Spawn services ----
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let http_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = run_http_server(state, shutdown.clone()).await {
                tracing::error!(error = %e, "HTTP server failed");
                shutdown.cancel();
            }
        }
    });

    let refresh_handle = tokio::spawn(refresh::scheduler::run_refresh_loop(
        refresher,
        config.refresh.interval(),
        shutdown.clone(),
    ));

    // ---- Await shutdown ----
    let _ = tokio::try_join!(http_handle, refresh_handle);

    tracing::info!("langstats shut down cleanly");
    Ok(())
}
