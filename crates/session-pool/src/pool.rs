//! Session store and round-robin selection
//!
//! The store is an ordered `Vec<Session>` behind a `RwLock`; selection and
//! snapshotting take the read path, a refresh swaps the whole vector on the
//! write path. The selection cursor is a single `AtomicUsize` advanced with one
//! read-modify-write, so concurrent callers never observe the same transition
//! twice.
//!
//! Callers resolve a selected index with `get`. When a concurrent replacement
//! shrank the pool between `select_next` and `get`, resolution returns `None`
//! and the caller treats that attempt as retryable.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::Session;

/// Ordered pool of upstream sessions with a shared round-robin cursor.
pub struct SessionPool {
    sessions: RwLock<Vec<Session>>,
    cursor: AtomicUsize,
    /// Held for the whole of a refresh cycle so cycles never overlap.
    refresh_lock: Mutex<()>,
}

impl SessionPool {
    pub fn new(sessions: Vec<Session>) -> Self {
        info!(sessions = sessions.len(), "session pool initialized");
        Self {
            sessions: RwLock::new(sessions),
            cursor: AtomicUsize::new(0),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Return the current cursor and advance it to `(cursor + 1) % len`.
    ///
    /// Fails fast with `NoSessions` when the pool is empty.
    pub async fn select_next(&self) -> Result<usize> {
        let len = self.sessions.read().await.len();
        if len == 0 {
            return Err(Error::NoSessions);
        }

        let index = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + 1) % len)
            })
            // The closure always returns Some, so fetch_update cannot fail.
            .unwrap_or_else(|current| current);

        debug!(index, len, "selected session index");
        Ok(index)
    }

    /// Resolve an index against the current pool contents.
    pub async fn get(&self, index: usize) -> Option<Session> {
        self.sessions.read().await.get(index).cloned()
    }

    /// Owned copy of every session, insulated from later replacement.
    pub async fn snapshot(&self) -> Vec<Session> {
        self.sessions.read().await.clone()
    }

    /// Swap the whole pool in one step.
    pub async fn replace(&self, sessions: Vec<Session>) {
        let mut guard = self.sessions.write().await;
        let previous = guard.len();
        *guard = sessions;
        info!(previous, current = guard.len(), "session pool replaced");
    }

    /// Wait until no refresh cycle is running and block new ones.
    pub async fn refresh_guard(&self) -> MutexGuard<'_, ()> {
        self.refresh_lock.lock().await
    }

    /// `None` while another refresh cycle holds the guard.
    pub fn try_refresh_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.refresh_lock.try_lock().ok()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pool summary for the health and admin endpoints. Never includes tokens.
    pub async fn health(&self) -> serde_json::Value {
        let total = self.len().await;
        let status = if total > 0 { "healthy" } else { "unhealthy" };
        serde_json::json!({
            "status": status,
            "sessions_total": total,
            "cursor": self.cursor.load(Ordering::Acquire),
        })
    }
}
