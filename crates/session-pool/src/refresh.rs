//! Periodic background session refresh
//!
//! Every cycle refreshes all sessions concurrently, replaces the pool with the
//! results in one step, then rewrites the snapshot. A session whose refresh
//! fails keeps its previous token. The background task runs independently of
//! the request path; in-flight requests keep the session they already resolved.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pool::SessionPool;
use crate::session::Session;
use crate::snapshot::SnapshotStore;

/// Exchanges a session for a renewed one.
///
/// Implemented by the upstream client. Methods return boxed futures so the
/// trait stays dyn-compatible.
pub trait SessionRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        session: &'a Session,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>>;
}

/// Outcome counts of one refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub kept: usize,
}

/// Spawn a background task that refreshes the pool every `interval`.
///
/// The first tick is skipped: sessions were just loaded.
pub fn spawn_refresh_task(
    pool: Arc<SessionPool>,
    refresher: Arc<dyn SessionRefresher>,
    store: Arc<SnapshotStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&pool, refresher.as_ref(), Some(&store)).await;
        }
    })
}

/// Run one refresh cycle over the whole pool, waiting for any cycle already
/// in progress to finish first.
///
/// Snapshot persistence is best-effort: a failed write is logged and the
/// in-memory pool keeps the refreshed sessions.
pub async fn refresh_cycle(
    pool: &SessionPool,
    refresher: &dyn SessionRefresher,
    store: Option<&SnapshotStore>,
) -> RefreshSummary {
    let _guard = pool.refresh_guard().await;
    run_cycle(pool, refresher, store).await
}

/// Like `refresh_cycle`, but returns `None` instead of waiting when another
/// cycle is running.
pub async fn try_refresh_cycle(
    pool: &SessionPool,
    refresher: &dyn SessionRefresher,
    store: Option<&SnapshotStore>,
) -> Option<RefreshSummary> {
    let _guard = pool.try_refresh_guard()?;
    Some(run_cycle(pool, refresher, store).await)
}

async fn run_cycle(
    pool: &SessionPool,
    refresher: &dyn SessionRefresher,
    store: Option<&SnapshotStore>,
) -> RefreshSummary {
    let current = pool.snapshot().await;
    if current.is_empty() {
        debug!("session pool empty, skipping refresh");
        return RefreshSummary::default();
    }

    let results = join_all(current.iter().map(|s| refresher.refresh(s))).await;

    let mut summary = RefreshSummary::default();
    let next: Vec<Session> = current
        .iter()
        .zip(results)
        .enumerate()
        .map(|(index, (old, result))| match result {
            Ok(fresh) => {
                summary.refreshed += 1;
                fresh
            }
            Err(e) => {
                warn!(index, error = %e, "session refresh failed, keeping previous token");
                summary.kept += 1;
                old.clone()
            }
        })
        .collect();

    pool.replace(next.clone()).await;

    if let Some(store) = store
        && let Err(e) = store.save(&next).await
    {
        warn!(error = %e, "failed to persist session snapshot");
    }

    info!(
        refreshed = summary.refreshed,
        kept = summary.kept,
        "session refresh cycle complete"
    );
    summary
}
