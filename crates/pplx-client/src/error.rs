//! Error types for upstream operations

/// Errors from upstream calls, uploads and event decoding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The upstream answered 429, or an upload URL came back rate limited.
    #[error("rate limited by upstream")]
    RateLimited,

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::RateLimited => "rate_limited",
            Error::Status { .. } => "status",
            Error::Upload(_) => "upload",
            Error::Decode(_) => "decode",
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, Error>;
