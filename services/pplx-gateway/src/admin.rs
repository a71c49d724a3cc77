//! Admin API for the session pool
//!
//! Endpoints:
//! - GET  /admin/pool          pool status summary
//! - POST /admin/pool/refresh  run one refresh cycle now
//!
//! Session tokens are never returned.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use session_pool::{SessionPool, SessionRefresher, SnapshotStore, try_refresh_cycle};
use tracing::info;

#[derive(Clone)]
pub struct AdminState {
    pool: Arc<SessionPool>,
    refresher: Arc<dyn SessionRefresher>,
    snapshot: Arc<SnapshotStore>,
}

impl AdminState {
    pub fn new(
        pool: Arc<SessionPool>,
        refresher: Arc<dyn SessionRefresher>,
        snapshot: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            pool,
            refresher,
            snapshot,
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/pool/refresh", post(refresh_pool))
        .with_state(state)
}

async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.pool.health().await;

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        health.to_string(),
    )
}

/// Returns `409` while another refresh cycle, manual or scheduled, is running.
async fn refresh_pool(State(state): State<AdminState>) -> impl IntoResponse {
    let started = Instant::now();
    let Some(summary) = try_refresh_cycle(
        &state.pool,
        state.refresher.as_ref(),
        Some(&state.snapshot),
    )
    .await
    else {
        return (
            StatusCode::CONFLICT,
            [(CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": "refresh already in progress" }).to_string(),
        );
    };
    info!(
        refreshed = summary.refreshed,
        kept = summary.kept,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "manual session refresh complete"
    );

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "refreshed": summary.refreshed,
            "kept": summary.kept,
            "sessions_total": state.pool.len().await,
        })
        .to_string(),
    )
}
