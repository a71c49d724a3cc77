//! Session pool for upstream web-session credentials
//!
//! Holds the ordered list of session tokens shared by every request, hands
//! out candidate indexes round-robin, and keeps the list fresh in the
//! background. The pool is an explicit object owned by the service and passed
//! to request handlers; there is no process-wide state.
//!
//! Session lifecycle:
//! 1. Loaded from the persisted snapshot (or configuration) at startup
//! 2. Selected round-robin by the failover controller, one index per attempt
//! 3. Replaced wholesale by the background refresh cycle
//! 4. Snapshot rewritten atomically after each refresh cycle

pub mod error;
pub mod pool;
pub mod refresh;
pub mod session;
pub mod snapshot;

pub use error::{Error, Result};
pub use pool::SessionPool;
pub use refresh::{
    RefreshSummary, SessionRefresher, refresh_cycle, spawn_refresh_task, try_refresh_cycle,
};
pub use session::Session;
pub use snapshot::SnapshotStore;
