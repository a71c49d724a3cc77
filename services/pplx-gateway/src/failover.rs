//! Session failover controller
//!
//! A request gets at most one attempt per session in the pool, measured when
//! the request starts. Each attempt takes the next session from the shared
//! round-robin cursor and runs every upstream call (uploads and the ask
//! itself) with that one session, since upload references are only valid
//! for the session that created them.
//!
//! An attempt succeeds once its response is committed. Buffered replies
//! commit after the whole body was read; streaming replies commit at the
//! first translated delta, or at the end of the body if none came. Anything
//! that fails before the commit point moves on to the next session. Because
//! other requests advance the same cursor, a request is not guaranteed to
//! visit every session.

use std::sync::Arc;

use pplx_client::{Query, Upstream};
use session_pool::SessionPool;
use tracing::{debug, error, info, warn};

use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::ResolvedModel;
use crate::prompt::Prompt;
use crate::relay::{Relay, StreamingReply};
use crate::translate::{TranslateOptions, Translator};

/// Everything an attempt needs, fixed for the whole request.
pub struct ChatJob {
    /// Original prompt. Attempts work on a copy.
    pub prompt: Prompt,
    pub model: ResolvedModel,
    pub incognito: bool,
    pub stream: bool,
}

pub enum Reply {
    Buffered(String),
    Streaming(StreamingReply),
}

pub enum AttemptOutcome {
    Success(Reply),
    /// Try the next session. Carries a reason for the log.
    Retryable(String),
    Fatal(Error),
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success(_) => "success",
            AttemptOutcome::Retryable(_) => "retryable",
            AttemptOutcome::Fatal(_) => "fatal",
        }
    }
}

pub struct Controller {
    pool: Arc<SessionPool>,
    upstream: Arc<dyn Upstream>,
    chat: ChatConfig,
}

impl Controller {
    pub fn new(pool: Arc<SessionPool>, upstream: Arc<dyn Upstream>, chat: ChatConfig) -> Self {
        Self {
            pool,
            upstream,
            chat,
        }
    }

    pub fn chat_config(&self) -> &ChatConfig {
        &self.chat
    }

    pub async fn run(&self, job: &ChatJob) -> Result<Reply> {
        let max_attempts = self.pool.len().await;
        if max_attempts == 0 {
            return Err(Error::NoSessions);
        }

        for attempt in 0..max_attempts {
            let outcome = self.attempt(job).await;
            metrics::record_attempt(outcome.label());
            match outcome {
                AttemptOutcome::Success(reply) => return Ok(reply),
                AttemptOutcome::Retryable(reason) => {
                    warn!(attempt, max_attempts, reason = %reason, "attempt failed");
                }
                AttemptOutcome::Fatal(err) => return Err(err),
            }
        }

        error!(attempts = max_attempts, "all attempts failed");
        Err(Error::Exhausted)
    }

    /// One attempt against one session.
    pub async fn attempt(&self, job: &ChatJob) -> AttemptOutcome {
        let index = match self.pool.select_next().await {
            Ok(index) => index,
            Err(e) => return AttemptOutcome::Fatal(e.into()),
        };
        let Some(session) = self.pool.get(index).await else {
            return AttemptOutcome::Retryable(format!("session {index} left the pool"));
        };
        debug!(index, "attempt using session");

        let mut attachments = Vec::with_capacity(job.prompt.images.len() + 1);
        for image in &job.prompt.images {
            match self.upstream.upload_image(&session, image).await {
                Ok(reference) => attachments.push(reference),
                Err(e) => return upstream_failure(index, "image upload", e),
            }
        }

        let mut prompt = job.prompt.text.clone();
        if prompt.len() > self.chat.max_chat_history_length {
            match self.upstream.upload_text(&session, &prompt).await {
                Ok(reference) => {
                    debug!(index, bytes = prompt.len(), "prompt uploaded as file");
                    attachments.push(reference);
                    prompt = self.chat.prompt_for_file.clone();
                }
                Err(e) => return upstream_failure(index, "text upload", e),
            }
        }

        let query = Query {
            prompt,
            model: job.model.upstream.clone(),
            search: job.model.search,
            incognito: job.incognito,
            attachments,
        };
        let body = match self.upstream.ask(&session, &query).await {
            Ok(body) => body,
            Err(e) => return upstream_failure(index, "ask", e),
        };

        let translator = Translator::new(&job.model.upstream, TranslateOptions::from(&self.chat));
        let mut relay = Relay::new(body, translator);

        if job.stream {
            let first = match relay.next_delta().await {
                Some(Ok(delta)) => Some(delta),
                Some(Err(e)) => return upstream_failure(index, "read", e),
                None => None,
            };
            info!(index, "stream committed");
            AttemptOutcome::Success(Reply::Streaming(StreamingReply { first, relay }))
        } else {
            match relay.drain().await {
                Ok(text) => {
                    info!(index, chars = text.chars().count(), "response complete");
                    AttemptOutcome::Success(Reply::Buffered(text))
                }
                Err(e) => upstream_failure(index, "read", e),
            }
        }
    }
}

fn upstream_failure(index: usize, stage: &str, err: pplx_client::Error) -> AttemptOutcome {
    metrics::record_upstream_error(err.kind());
    warn!(index, stage, kind = err.kind(), error = %err, "upstream call failed");
    AttemptOutcome::Retryable(format!("{stage}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pplx_client::{Attachment, BoxFuture, EventBody};
    use session_pool::Session;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Script {
        Lines(Vec<pplx_client::Result<String>>),
        RateLimited,
        Status(u16),
    }

    #[derive(Debug, Clone)]
    struct Call {
        op: &'static str,
        token: String,
        payload: String,
        query: Option<Query>,
    }

    #[derive(Default)]
    struct ScriptedUpstream {
        asks: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<Call>>,
        /// Image uploads with this token fail.
        reject_uploads_for: Option<&'static str>,
    }

    impl ScriptedUpstream {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                asks: Mutex::new(scripts.into()),
                ..Default::default()
            }
        }

        fn record(&self, op: &'static str, session: &Session, payload: String, query: Option<Query>) {
            self.calls.lock().unwrap().push(Call {
                op,
                token: session.token().to_string(),
                payload,
                query,
            });
        }

        fn calls(&self, op: &str) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.op == op)
                .cloned()
                .collect()
        }

        fn all_calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Upstream for ScriptedUpstream {
        fn ask<'a>(
            &'a self,
            session: &'a Session,
            query: &'a Query,
        ) -> BoxFuture<'a, pplx_client::Result<EventBody>> {
            Box::pin(async move {
                self.record("ask", session, query.prompt.clone(), Some(query.clone()));
                let script = self.asks.lock().unwrap().pop_front();
                match script {
                    Some(Script::Lines(lines)) => {
                        let body: EventBody = Box::pin(futures_util::stream::iter(
                            lines.into_iter().map(|l| l.map(Bytes::from)),
                        ));
                        Ok(body)
                    }
                    Some(Script::RateLimited) => Err(pplx_client::Error::RateLimited),
                    Some(Script::Status(status)) => Err(pplx_client::Error::Status {
                        status,
                        body: String::new(),
                    }),
                    None => Err(pplx_client::Error::Http("script exhausted".into())),
                }
            })
        }

        fn upload_image<'a>(
            &'a self,
            session: &'a Session,
            image: &'a Attachment,
        ) -> BoxFuture<'a, pplx_client::Result<String>> {
            Box::pin(async move {
                self.record("upload_image", session, format!("{image:?}"), None);
                if self.reject_uploads_for == Some(session.token()) {
                    return Err(pplx_client::Error::Upload("rejected".into()));
                }
                Ok(format!("img-{}", session.token()))
            })
        }

        fn upload_text<'a>(
            &'a self,
            session: &'a Session,
            text: &'a str,
        ) -> BoxFuture<'a, pplx_client::Result<String>> {
            Box::pin(async move {
                self.record("upload_text", session, text.to_string(), None);
                Ok(format!("txt-{}", session.token()))
            })
        }
    }

    fn markdown(text: &str) -> pplx_client::Result<String> {
        Ok(format!(
            "data: {}\n",
            serde_json::json!({"blocks":[{"markdown_block":{"chunks":[text]}}]})
        ))
    }

    fn completed() -> pplx_client::Result<String> {
        Ok("data: {\"status\":\"COMPLETED\",\"display_model\":\"claude2\",\"blocks\":[]}\n".into())
    }

    fn read_error() -> pplx_client::Result<String> {
        Err(pplx_client::Error::Http("connection reset".into()))
    }

    fn controller(tokens: &[&str], upstream: Arc<ScriptedUpstream>) -> Controller {
        controller_with(tokens, upstream, ChatConfig::default())
    }

    fn controller_with(
        tokens: &[&str],
        upstream: Arc<ScriptedUpstream>,
        chat: ChatConfig,
    ) -> Controller {
        let pool = SessionPool::new(tokens.iter().map(|t| Session::new(*t)).collect());
        Controller::new(Arc::new(pool), upstream, chat)
    }

    fn job(text: &str, stream: bool) -> ChatJob {
        ChatJob {
            prompt: Prompt {
                text: text.to_string(),
                images: Vec::new(),
            },
            model: crate::models::resolve("claude-3.7-sonnet"),
            incognito: true,
            stream,
        }
    }

    fn buffered(reply: Reply) -> String {
        match reply {
            Reply::Buffered(text) => text,
            Reply::Streaming(_) => panic!("expected buffered reply"),
        }
    }

    fn streaming(reply: Reply) -> StreamingReply {
        match reply {
            Reply::Streaming(reply) => reply,
            Reply::Buffered(_) => panic!("expected streaming reply"),
        }
    }

    fn tokens(calls: &[Call]) -> Vec<&str> {
        calls.iter().map(|c| c.token.as_str()).collect()
    }

    #[tokio::test]
    async fn rate_limited_attempt_moves_to_next_session() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Script::RateLimited,
            Script::Lines(vec![markdown("hi"), completed()]),
        ]));
        let controller = controller(&["a", "b"], upstream.clone());

        let reply = controller.run(&job("Human: Hi\n\n", false)).await.unwrap();
        assert_eq!(buffered(reply), "hi");
        assert_eq!(tokens(&upstream.calls("ask")), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn query_carries_model_search_and_incognito() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![Script::Lines(vec![completed()])]));
        let controller = controller(&["a"], upstream.clone());
        let mut job = job("Human: Hi\n\n", false);
        job.model = crate::models::resolve("gpt-4o-search");
        job.incognito = false;

        controller.run(&job).await.unwrap();
        let query = upstream.calls("ask")[0].query.clone().unwrap();
        assert_eq!(query.model, "gpt4o");
        assert!(query.search);
        assert!(!query.incognito);
        assert_eq!(query.prompt, "Human: Hi\n\n");
        assert!(query.attachments.is_empty());
    }

    #[tokio::test]
    async fn exhaustion_after_one_attempt_per_session() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Script::Status(500),
            Script::RateLimited,
            Script::Status(403),
            Script::Lines(vec![markdown("never reached")]),
        ]));
        let controller = controller(&["a", "b", "c"], upstream.clone());

        let err = controller.run(&job("x", false)).await.err().unwrap();
        assert!(matches!(err, Error::Exhausted));
        assert_eq!(upstream.calls("ask").len(), 3);
    }

    #[tokio::test]
    async fn empty_pool_is_fatal_without_upstream_calls() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![]));
        let controller = controller(&[], upstream.clone());

        let err = controller.run(&job("x", true)).await.err().unwrap();
        assert!(matches!(err, Error::NoSessions));
        assert!(upstream.all_calls().is_empty());
    }

    #[tokio::test]
    async fn prompt_is_reset_between_attempts() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Script::RateLimited,
            Script::Lines(vec![markdown("ok"), completed()]),
        ]));
        let chat = ChatConfig {
            max_chat_history_length: 8,
            prompt_for_file: "see attached file".into(),
            ..ChatConfig::default()
        };
        let controller = controller_with(&["a", "b"], upstream.clone(), chat);
        let original = "Human: a long conversation\n\n";

        let reply = controller.run(&job(original, false)).await.unwrap();
        assert_eq!(buffered(reply), "ok");

        let uploads = upstream.calls("upload_text");
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|c| c.payload == original));
        assert_eq!(tokens(&uploads), vec!["a", "b"]);

        let asks = upstream.calls("ask");
        for ask in &asks {
            let query = ask.query.as_ref().unwrap();
            assert_eq!(query.prompt, "see attached file");
            assert_eq!(query.attachments, vec![format!("txt-{}", ask.token)]);
        }
    }

    #[tokio::test]
    async fn prompt_at_limit_is_sent_inline() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![Script::Lines(vec![completed()])]));
        let chat = ChatConfig {
            max_chat_history_length: 4,
            ..ChatConfig::default()
        };
        let controller = controller_with(&["a"], upstream.clone(), chat);

        controller.run(&job("abcd", false)).await.unwrap();
        assert!(upstream.calls("upload_text").is_empty());
        assert_eq!(upstream.calls("ask")[0].payload, "abcd");
    }

    #[tokio::test]
    async fn uploads_and_ask_share_one_session() {
        let upstream = Arc::new(ScriptedUpstream {
            asks: Mutex::new(vec![Script::Lines(vec![markdown("seen"), completed()])].into()),
            reject_uploads_for: Some("a"),
            ..Default::default()
        });
        let controller = controller(&["a", "b"], upstream.clone());
        let mut job = job("Human: what is this?\n\n", false);
        job.prompt.images = vec![
            Attachment::Inline("aGVsbG8=".into()),
            Attachment::Remote("https://example.com/cat.png".into()),
        ];

        let reply = controller.run(&job).await.unwrap();
        assert_eq!(buffered(reply), "seen");

        let calls = upstream.all_calls();
        let ops: Vec<(&str, &str)> = calls.iter().map(|c| (c.op, c.token.as_str())).collect();
        assert_eq!(
            ops,
            vec![
                ("upload_image", "a"),
                ("upload_image", "b"),
                ("upload_image", "b"),
                ("ask", "b"),
            ]
        );
        let query = upstream.calls("ask")[0].query.clone().unwrap();
        assert_eq!(query.attachments, vec!["img-b", "img-b"]);
    }

    #[tokio::test]
    async fn read_error_before_first_delta_retries() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Script::Lines(vec![Ok(": ping\n".into()), read_error()]),
            Script::Lines(vec![markdown("ok"), completed()]),
        ]));
        let controller = controller(&["a", "b"], upstream.clone());

        let reply = streaming(controller.run(&job("x", true)).await.unwrap());
        assert_eq!(reply.first.as_deref(), Some("ok"));
        assert_eq!(tokens(&upstream.calls("ask")), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn read_error_after_first_delta_is_not_retried() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Script::Lines(vec![markdown("partial"), read_error()]),
            Script::Lines(vec![markdown("other"), completed()]),
        ]));
        let controller = controller(&["a", "b"], upstream.clone());

        let mut reply = streaming(controller.run(&job("x", true)).await.unwrap());
        assert_eq!(reply.first.as_deref(), Some("partial"));
        assert!(matches!(reply.relay.next_delta().await, Some(Err(_))));
        assert_eq!(upstream.calls("ask").len(), 1);
    }

    #[tokio::test]
    async fn buffered_read_error_retries() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Script::Lines(vec![markdown("partial"), read_error()]),
            Script::Lines(vec![markdown("whole"), completed()]),
        ]));
        let controller = controller(&["a", "b"], upstream.clone());

        let reply = controller.run(&job("x", false)).await.unwrap();
        assert_eq!(buffered(reply), "whole");
    }

    #[tokio::test]
    async fn stream_without_deltas_commits_at_body_end() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![Script::Lines(vec![completed()])]));
        let controller = controller(&["a", "b"], upstream.clone());

        let reply = streaming(controller.run(&job("x", true)).await.unwrap());
        assert!(reply.first.is_none());
        assert_eq!(upstream.calls("ask").len(), 1);
    }

    #[tokio::test]
    async fn malformed_line_is_skipped() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![Script::Lines(vec![
            Ok("data: {not json\n".into()),
            markdown("fine"),
            completed(),
        ])]));
        let controller = controller(&["a"], upstream);

        let reply = controller.run(&job("x", false)).await.unwrap();
        assert_eq!(buffered(reply), "fine");
    }

    #[tokio::test]
    async fn buffered_single_web_result() {
        let terminal = serde_json::json!({
            "status": "COMPLETED",
            "display_model": "claude2",
            "blocks": [{"web_result_block": {"web_results": [
                {"name": "Rust", "snippet": "A language", "url": "https://rust-lang.org"}
            ]}}]
        });
        let upstream = Arc::new(ScriptedUpstream::new(vec![Script::Lines(vec![Ok(format!(
            "data: {terminal}\n"
        ))])]));
        let controller = controller(&["a"], upstream);

        let reply = controller.run(&job("x", false)).await.unwrap();
        assert_eq!(
            buffered(reply),
            "\n\n---\n\n\n<details>\n<summary>[1] Rust</summary>\n\nA language\n\n[Link](https://rust-lang.org)\n\n</details>"
        );
    }

    #[tokio::test]
    async fn round_robin_continues_across_requests() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Script::Lines(vec![completed()]),
            Script::Lines(vec![completed()]),
            Script::Lines(vec![completed()]),
        ]));
        let controller = controller(&["a", "b"], upstream.clone());

        for _ in 0..3 {
            controller.run(&job("x", false)).await.unwrap();
        }
        assert_eq!(tokens(&upstream.calls("ask")), vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn attempts_are_counted_by_outcome() {
        let (recorder, handle) = crate::metrics::tests::isolated_recorder();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Script::RateLimited,
            Script::Lines(vec![completed()]),
        ]));
        let controller = controller(&["a", "b"], upstream);
        controller.run(&job("x", false)).await.unwrap();

        let output = handle.render();
        assert!(output.contains("gateway_attempts_total{outcome=\"retryable\"} 1"));
        assert!(output.contains("gateway_attempts_total{outcome=\"success\"} 1"));
        assert!(output.contains("gateway_upstream_errors_total{error_type=\"rate_limited\"} 1"));
    }
}
