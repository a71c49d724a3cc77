//! A single upstream session credential

use common::Secret;

/// Opaque session token authorizing upstream calls for one account.
///
/// Identity is the token value. Sessions are never mutated in place: a refresh
/// produces a new `Session` that replaces the old one in the pool.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: Secret<String>,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Secret::new(token.into()),
        }
    }

    /// Raw token value, for building the upstream cookie.
    pub fn token(&self) -> &str {
        self.token.expose()
    }
}

impl From<Secret<String>> for Session {
    fn from(token: Secret<String>) -> Self {
        Self { token }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("token", &self.token).finish()
    }
}
