//! Request-path errors and their HTTP mapping

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Terminal outcome of one chat request.
///
/// Transient upstream and upload failures never surface here: the failover
/// controller retries them and reports `Exhausted` once the budget is spent.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no sessions configured")]
    NoSessions,

    #[error("Failed to process request after multiple attempts")]
    Exhausted,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NoSessions => StatusCode::SERVICE_UNAVAILABLE,
            Error::Exhausted => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<session_pool::Error> for Error {
    fn from(err: session_pool::Error) -> Self {
        match err {
            session_pool::Error::NoSessions => Error::NoSessions,
            _ => Error::Exhausted,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (
            self.status(),
            [(CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
