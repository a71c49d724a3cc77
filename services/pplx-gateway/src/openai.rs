//! OpenAI chat-completions wire types
//!
//! Inbound decoding is lenient where clients disagree (content may be a
//! string or a list of parts, unknown part types are ignored). Outbound
//! shapes follow the chat.completion and chat.completion.chunk objects.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Per-request override of the configured incognito flag.
    #[serde(default, alias = "incognito")]
    pub is_incognito: Option<bool>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    /// Any other JSON shape; accepted so one odd message does not fail the
    /// whole request.
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_url: Option<ImageUrl>,
}

#[derive(Debug, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One streamed delta, serialized as a `data:` line.
#[derive(Debug, Serialize)]
pub struct ChatChunk<'a> {
    pub id: &'a str,
    pub object: &'static str,
    pub created: u64,
    pub model: &'a str,
    pub choices: [ChunkChoice<'a>; 1],
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice<'a> {
    pub index: u32,
    pub delta: Delta<'a>,
    pub logprobs: Option<()>,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct Delta<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

impl<'a> ChatChunk<'a> {
    pub fn new(id: &'a str, model: &'a str, created: u64, content: &'a str) -> Self {
        Self {
            id,
            object: "chat.completion.chunk",
            created,
            model,
            choices: [ChunkChoice {
                index: 0,
                delta: Delta {
                    role: "assistant",
                    content,
                },
                logprobs: None,
                finish_reason: None,
            }],
        }
    }
}

/// Buffered reply.
#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub logprobs: Option<()>,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
    pub refusal: Option<String>,
    pub annotations: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl ChatCompletion {
    pub fn new(model: &str, content: String) -> Self {
        let estimate = content.chars().count() / 4;
        Self {
            id: completion_id(),
            object: "chat.completion",
            created: unix_now(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                    refusal: None,
                    annotations: Vec::new(),
                },
                logprobs: None,
                finish_reason: "stop",
            }],
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: estimate,
                total_tokens: estimate,
            },
        }
    }
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().as_simple())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
