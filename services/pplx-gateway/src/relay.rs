//! Upstream body to translated deltas, and deltas to an SSE body

use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Instant;

use axum::body::Body;
use bytes::Bytes;
use pplx_client::{EventBody, EventLines};
use tracing::{debug, warn};

use crate::metrics;
use crate::openai::{ChatChunk, completion_id, unix_now};
use crate::translate::Translator;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Pull-driven pipeline: a line is read from upstream only when the caller
/// asks for the next delta and none is pending.
pub struct Relay {
    lines: EventLines,
    translator: Translator,
    pending: VecDeque<String>,
}

impl Relay {
    pub fn new(body: EventBody, translator: Translator) -> Self {
        Self {
            lines: EventLines::new(body),
            translator,
            pending: VecDeque::new(),
        }
    }

    /// Next non-empty delta. `None` once the terminal event has been handled
    /// or the body ended; the rest of the body is never read.
    pub async fn next_delta(&mut self) -> Option<pplx_client::Result<String>> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Some(Ok(delta));
            }
            if self.translator.is_finished() {
                return None;
            }
            match self.lines.next_line().await? {
                Ok(line) => self.pending.extend(self.translator.feed_line(&line)),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Consume the whole response and return the accumulated text.
    pub async fn drain(mut self) -> pplx_client::Result<String> {
        while let Some(delta) = self.next_delta().await {
            delta?;
        }
        Ok(self.translator.into_text())
    }
}

/// A streaming response past its commit point. `first` is the delta that
/// committed it, `None` when the body ended before producing any.
pub struct StreamingReply {
    pub first: Option<String>,
    pub relay: Relay,
}

impl StreamingReply {
    /// Render as `text/event-stream` frames. A clean end writes the `[DONE]`
    /// marker; a read error ends the stream without it.
    ///
    /// The request's count and duration are recorded when the body is
    /// dropped, measured from `started`.
    pub fn into_body(self, model: String, started: Instant) -> Body {
        let id = completion_id();
        let created = unix_now();
        let StreamingReply { first, mut relay } = self;
        let mut timer = StreamTimer::new(started);

        let stream = async_stream::stream! {
            if let Some(delta) = first {
                yield Ok::<_, Infallible>(chunk_frame(&id, &model, created, &delta));
            }
            loop {
                match relay.next_delta().await {
                    Some(Ok(delta)) => yield Ok(chunk_frame(&id, &model, created, &delta)),
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream read failed after response was committed");
                        metrics::record_upstream_error(e.kind());
                        timer.finish("stream_aborted");
                        return;
                    }
                    None => break,
                }
            }
            debug!(id = %id, "stream complete");
            timer.finish("stream");
            yield Ok(Bytes::from_static(DONE_FRAME));
        };

        Body::from_stream(stream)
    }
}

/// Records a streamed request on drop. Until finished, the mode is
/// `stream_cancelled`: the client went away before the stream ended.
struct StreamTimer {
    started: Instant,
    mode: &'static str,
}

impl StreamTimer {
    fn new(started: Instant) -> Self {
        Self {
            started,
            mode: "stream_cancelled",
        }
    }

    fn finish(&mut self, mode: &'static str) {
        self.mode = mode;
    }
}

impl Drop for StreamTimer {
    fn drop(&mut self) {
        metrics::record_request(200, self.mode, self.started.elapsed().as_secs_f64());
    }
}

fn chunk_frame(id: &str, model: &str, created: u64, delta: &str) -> Bytes {
    let chunk = serde_json::json!(ChatChunk::new(id, model, created, delta));
    Bytes::from(format!("data: {chunk}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::isolated_recorder;
    use crate::translate::TranslateOptions;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Sets its flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl DropFlag {
        fn touch(&self) {}
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn body(chunks: Vec<pplx_client::Result<String>>) -> EventBody {
        Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(|c| c.map(Bytes::from)),
        ))
    }

    fn markdown(text: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({"blocks":[{"markdown_block":{"chunks":[text]}}]})
        )
    }

    fn completed() -> String {
        "data: {\"status\":\"COMPLETED\",\"display_model\":\"claude2\",\"blocks\":[]}\n".to_string()
    }

    fn relay(chunks: Vec<pplx_client::Result<String>>) -> Relay {
        Relay::new(
            body(chunks),
            Translator::new("claude2", TranslateOptions::default()),
        )
    }

    async fn collect(body: Body) -> String {
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn frames(text: &str) -> Vec<String> {
        text.split("\n\n")
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn deltas_are_pulled_line_by_line() {
        let mut relay = relay(vec![
            Ok(": ping\n".into()),
            Ok(markdown("Hel")),
            Ok(markdown("lo")),
            Ok(completed()),
        ]);
        assert_eq!(relay.next_delta().await.unwrap().unwrap(), "Hel");
        assert_eq!(relay.next_delta().await.unwrap().unwrap(), "lo");
        assert!(relay.next_delta().await.is_none());
    }

    #[tokio::test]
    async fn nothing_is_read_after_terminal_event() {
        let mut relay = relay(vec![
            Ok(completed()),
            Err(pplx_client::Error::Http("should not be read".into())),
        ]);
        assert!(relay.next_delta().await.is_none());
        assert!(relay.next_delta().await.is_none());
    }

    #[tokio::test]
    async fn drain_returns_accumulated_text() {
        let relay = relay(vec![Ok(markdown("a")), Ok(markdown("b")), Ok(completed())]);
        assert_eq!(relay.drain().await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn drain_surfaces_read_errors() {
        let relay = relay(vec![
            Ok(markdown("a")),
            Err(pplx_client::Error::Http("reset".into())),
        ]);
        assert!(matches!(relay.drain().await, Err(pplx_client::Error::Http(_))));
    }

    #[tokio::test]
    async fn body_end_without_terminal_event_is_normal() {
        let relay = relay(vec![Ok(markdown("partial"))]);
        assert_eq!(relay.drain().await.unwrap(), "partial");
    }

    #[tokio::test]
    async fn sse_body_frames_deltas_and_done_marker() {
        let mut relay = relay(vec![Ok(markdown("Hel")), Ok(markdown("lo")), Ok(completed())]);
        let first = relay.next_delta().await.unwrap().unwrap();
        let reply = StreamingReply {
            first: Some(first),
            relay,
        };

        let text = collect(reply.into_body("gpt-4o".into(), Instant::now())).await;
        let frames = frames(&text);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], "data: [DONE]");

        let chunks: Vec<serde_json::Value> = frames[..2]
            .iter()
            .map(|f| serde_json::from_str(f.strip_prefix("data: ").unwrap()).unwrap())
            .collect();
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "lo");
        assert_eq!(chunks[0]["model"], "gpt-4o");
        assert_eq!(chunks[0]["id"], chunks[1]["id"]);
    }

    #[tokio::test]
    async fn empty_committed_stream_is_only_done_marker() {
        let reply = StreamingReply {
            first: None,
            relay: relay(vec![]),
        };
        assert_eq!(collect(reply.into_body("m".into(), Instant::now())).await, "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn read_error_after_commit_ends_without_done() {
        let mut relay = relay(vec![
            Ok(markdown("first")),
            Err(pplx_client::Error::Http("reset".into())),
        ]);
        let first = relay.next_delta().await.unwrap().unwrap();
        let reply = StreamingReply {
            first: Some(first),
            relay,
        };

        let (recorder, handle) = isolated_recorder();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let text = collect(reply.into_body("m".into(), Instant::now())).await;
        assert!(text.contains("\"first\""));
        assert!(!text.contains("[DONE]"));
        assert!(handle.render().contains("mode=\"stream_aborted\""));
    }

    #[tokio::test]
    async fn finished_stream_records_request_once_drained() {
        let (recorder, handle) = isolated_recorder();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let mut relay = relay(vec![Ok(markdown("a")), Ok(completed())]);
        let first = relay.next_delta().await.unwrap().unwrap();
        let body = StreamingReply {
            first: Some(first),
            relay,
        }
        .into_body("m".into(), Instant::now());
        assert!(!handle.render().contains("gateway_requests_total"));

        collect(body).await;
        let output = handle.render();
        assert!(output.contains("mode=\"stream\""));
        assert!(output.contains("gateway_request_duration_seconds_count"));
        assert!(!output.contains("stream_cancelled"));
    }

    #[tokio::test]
    async fn dropping_the_body_stops_reading_upstream() {
        let (recorder, handle) = isolated_recorder();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let dropped = Arc::new(AtomicBool::new(false));
        let polled = Arc::new(AtomicUsize::new(0));
        let flag = DropFlag(dropped.clone());
        let counter = polled.clone();
        let upstream: EventBody = Box::pin(futures_util::stream::iter(0..100).map(move |i| {
            flag.touch();
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, pplx_client::Error>(Bytes::from(markdown(&format!("w{i} "))))
        }));

        let mut relay = Relay::new(
            upstream,
            Translator::new("claude2", TranslateOptions::default()),
        );
        let first = relay.next_delta().await.unwrap().unwrap();
        assert_eq!(polled.load(Ordering::SeqCst), 1);

        let mut frames = StreamingReply {
            first: Some(first),
            relay,
        }
        .into_body("m".into(), Instant::now())
        .into_data_stream();
        let one = frames.next().await.unwrap().unwrap();
        let two = frames.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&one).contains("w0"));
        assert!(String::from_utf8_lossy(&two).contains("w1"));
        assert_eq!(polled.load(Ordering::SeqCst), 2);
        assert!(!dropped.load(Ordering::SeqCst));

        drop(frames);
        assert!(dropped.load(Ordering::SeqCst), "upstream body must be released");
        assert_eq!(polled.load(Ordering::SeqCst), 2);
        assert!(handle.render().contains("mode=\"stream_cancelled\""));
    }
}
