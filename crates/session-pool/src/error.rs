//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool is empty. This is a configuration problem, not a transient one.
    #[error("no sessions available")]
    NoSessions,

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("session refresh failed: {0}")]
    RefreshFailed(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
