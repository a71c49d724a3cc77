//! `POST /v1/chat/completions`

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{error, info};

use crate::AppState;
use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::failover::{ChatJob, Reply};
use crate::metrics;
use crate::models;
use crate::openai::{ChatCompletion, ChatRequest};
use crate::prompt;

/// Decode the body into a job. The raw body is taken so malformed JSON
/// gets the gateway's own 400 shape.
pub fn parse_job(body: &[u8], chat: &ChatConfig) -> Result<ChatJob> {
    let request: ChatRequest = serde_json::from_slice(body)
        .map_err(|e| Error::BadRequest(format!("Invalid request: {e}")))?;
    if request.messages.is_empty() {
        return Err(Error::BadRequest("No messages provided".into()));
    }

    Ok(ChatJob {
        prompt: prompt::build(&request.messages, chat.no_role_prefix),
        model: models::resolve(&request.model),
        incognito: request.is_incognito.unwrap_or(chat.is_incognito),
        stream: request.stream,
    })
}

pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let started = Instant::now();
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);

    let (mode, response) = match parse_job(&body, state.controller.chat_config()) {
        Ok(job) => {
            let mode = if job.stream { "stream" } else { "buffered" };
            info!(
                model = %job.model.public,
                upstream_model = %job.model.upstream,
                search = job.model.search,
                images = job.prompt.images.len(),
                mode,
                "chat request"
            );
            match state.controller.run(&job).await {
                // Recorded by the body once the stream ends.
                Ok(Reply::Streaming(reply)) => {
                    return event_stream(reply.into_body(job.model.public, started));
                }
                Ok(Reply::Buffered(text)) => (
                    mode,
                    Json(ChatCompletion::new(&job.model.public, text)).into_response(),
                ),
                Err(e) => {
                    error!(error = %e, "chat request failed");
                    (mode, e.into_response())
                }
            }
        }
        Err(e) => ("invalid", e.into_response()),
    };

    if !response.status().is_success() {
        state.stats.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(
        response.status().as_u16(),
        mode,
        started.elapsed().as_secs_f64(),
    );
    response
}

fn event_stream(body: Body) -> Response {
    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}
