//! Line reader over an upstream byte stream
//!
//! Splits the ask response body into lines without buffering the whole body.
//! A line is read only when the caller asks for it, so dropping the reader
//! releases the upstream connection at a line boundary.

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use crate::EventBody;
use crate::constants::MAX_LINE_BYTES;
use crate::error::{Error, Result};

type IoBody = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Pull-based line reader. Trailing `\r` is stripped.
pub struct EventLines {
    frames: FramedRead<StreamReader<IoBody, Bytes>, LinesCodec>,
    max_line: usize,
    done: bool,
}

impl EventLines {
    pub fn new(body: EventBody) -> Self {
        Self::with_limit(body, MAX_LINE_BYTES)
    }

    pub fn with_limit(body: EventBody, max_line: usize) -> Self {
        let body: IoBody = Box::pin(body.map(|chunk| chunk.map_err(io::Error::other)));
        Self {
            frames: FramedRead::new(
                StreamReader::new(body),
                LinesCodec::new_with_max_length(max_line),
            ),
            max_line,
            done: false,
        }
    }

    /// Next line, `None` at end of body.
    ///
    /// After an error or the end of the body every later call returns `None`.
    pub async fn next_line(&mut self) -> Option<Result<String>> {
        if self.done {
            return None;
        }

        match self.frames.next().await {
            Some(Ok(line)) => Some(Ok(line)),
            Some(Err(e)) => {
                self.done = true;
                Some(Err(self.map_error(e)))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    fn map_error(&self, err: LinesCodecError) -> Error {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                Error::Decode(format!("event line exceeds {} bytes", self.max_line))
            }
            LinesCodecError::Io(e) => from_io(e),
        }
    }
}

/// Transport errors come back wrapped in `io::Error`; anything else was
/// raised by the codec itself (invalid UTF-8).
fn from_io(err: io::Error) -> Error {
    let message = err.to_string();
    match err.into_inner().map(|inner| inner.downcast::<Error>()) {
        Some(Ok(inner)) => *inner,
        _ => Error::Decode(message),
    }
}
