//! Client for the Perplexity web API
//!
//! Speaks the same protocol as the web frontend: the session token travels as
//! a cookie, questions go to the SSE ask endpoint, attachments are uploaded
//! through signed Cloudinary/S3 forms first. The gateway talks to this crate
//! only through the `Upstream` trait so the failover policy can be exercised
//! against a scripted transport.

pub mod ask;
pub mod client;
pub mod constants;
pub mod error;
pub mod event;
pub mod lines;
pub mod upload;

pub use ask::Query;
pub use client::{ClientConfig, PplxClient};
pub use error::{Error, Result};
pub use event::{AskEvent, Block, Goal, ImageBlock, MediaItem, WebResult, parse_event_line};
pub use lines::EventLines;
pub use upload::Attachment;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use session_pool::Session;

/// Raw ask response body, read incrementally.
pub type EventBody = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Upstream operations used by one attempt.
///
/// Every call of an attempt must use the same session: upload references are
/// only valid for the session that created them.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Upstream>`).
pub trait Upstream: Send + Sync {
    /// Post a question. On success the returned body has not been read yet.
    fn ask<'a>(&'a self, session: &'a Session, query: &'a Query) -> BoxFuture<'a, Result<EventBody>>;

    /// Upload an image, returning the attachment reference.
    fn upload_image<'a>(
        &'a self,
        session: &'a Session,
        image: &'a Attachment,
    ) -> BoxFuture<'a, Result<String>>;

    /// Upload a text blob, returning the attachment reference.
    fn upload_text<'a>(&'a self, session: &'a Session, text: &'a str) -> BoxFuture<'a, Result<String>>;
}
