//! Perplexity chat gateway
//!
//! Single-binary service that:
//! 1. Accepts OpenAI-style chat completion requests
//! 2. Rotates them across a pool of Perplexity web sessions, failing over on
//!    rate limits and upstream errors
//! 3. Streams the translated answer back as chat completion chunks
//! 4. Refreshes every session in the background and persists the pool

mod admin;
mod auth;
mod chat;
mod config;
mod error;
mod failover;
mod metrics;
mod models;
mod openai;
mod prompt;
mod relay;
mod translate;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use pplx_client::{PplxClient, Upstream};
use session_pool::{Session, SessionPool, SessionRefresher, SnapshotStore, spawn_refresh_task};
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::{Config, SessionsConfig};
use crate::failover::Controller;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide counters reported by `/health`.
#[derive(Clone)]
struct ServiceStats {
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    started_at: Instant,
}

impl ServiceStats {
    fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    controller: Arc<Controller>,
    pool: Arc<SessionPool>,
    stats: ServiceStats,
    prometheus: PrometheusHandle,
}

/// Build the router. Chat, model and admin routes require the API key;
/// `/health` and `/metrics` do not.
fn build_router(
    state: AppState,
    admin: AdminState,
    api_key: Arc<Secret<String>>,
    max_connections: usize,
) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/hf/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models_handler))
        .route("/hf/v1/models", get(models_handler))
        .with_state(state.clone())
        .merge(admin::build_admin_router(admin))
        .route_layer(middleware::from_fn_with_state(
            api_key,
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(protected)
        .layer(ConcurrencyLimitLayer::new(max_connections))
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting pplx-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config_path, allow_missing) = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path, allow_missing)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let api_key = config
        .server
        .api_key
        .clone()
        .context("api key missing after validation")?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        proxy = config.upstream.proxy.is_some(),
        configured_sessions = config.sessions.tokens.len(),
        incognito = config.chat.is_incognito,
        "configuration loaded"
    );

    let client = Arc::new(
        PplxClient::new(config.upstream.client_config())
            .context("failed to build upstream client")?,
    );

    let snapshot = Arc::new(SnapshotStore::new(config.sessions.snapshot_path.clone()));
    let pool = Arc::new(SessionPool::new(
        initial_sessions(&config.sessions, &snapshot).await,
    ));
    if pool.is_empty().await {
        warn!("no sessions configured, chat requests will fail until sessions are added");
    }

    let refresher: Arc<dyn SessionRefresher> = client.clone();
    let refresh_task = spawn_refresh_task(
        pool.clone(),
        refresher.clone(),
        snapshot.clone(),
        Duration::from_secs(config.sessions.refresh_interval_secs),
    );

    let upstream: Arc<dyn Upstream> = client;
    let stats = ServiceStats::new();
    let state = AppState {
        controller: Arc::new(Controller::new(pool.clone(), upstream, config.chat.clone())),
        pool: pool.clone(),
        stats,
        prometheus,
    };
    let admin = AdminState::new(pool, refresher, snapshot);
    let app = build_router(
        state,
        admin,
        Arc::new(api_key),
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain deadline starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    refresh_task.abort();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Persisted sessions win over configured ones when the snapshot exists and
/// holds at least one session.
async fn initial_sessions(config: &SessionsConfig, snapshot: &SnapshotStore) -> Vec<Session> {
    let configured = || -> Vec<Session> {
        config
            .tokens
            .iter()
            .map(|token| Session::from(token.clone()))
            .collect()
    };

    match snapshot.load().await {
        Ok(Some(saved)) if !saved.is_empty() => {
            info!(
                sessions = saved.len(),
                path = %snapshot.path().display(),
                "using persisted sessions"
            );
            saved
        }
        Ok(_) => configured(),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable session snapshot");
            configured()
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
        "requests_served": state.stats.requests_total.load(Ordering::Relaxed),
        "errors_total": state.stats.errors_total.load(Ordering::Relaxed),
        "sessions": state.pool.len().await,
    });

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

async fn models_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        models::list().to_string(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
