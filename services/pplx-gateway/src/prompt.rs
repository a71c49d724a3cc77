//! Flatten chat messages into one upstream prompt

use pplx_client::Attachment;
use tracing::debug;

use crate::openai::{Message, MessageContent};

/// Prompt text plus image attachments collected from the messages.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub images: Vec<Attachment>,
}

fn role_prefix(role: &str) -> &'static str {
    match role {
        "system" => "System: ",
        "user" => "Human: ",
        "assistant" => "Assistant: ",
        _ => "Unknown: ",
    }
}

/// Build the prompt. Messages without a role or content are skipped; every
/// text is followed by a blank line.
pub fn build(messages: &[Message], no_role_prefix: bool) -> Prompt {
    let mut prompt = Prompt::default();

    for message in messages {
        let (Some(role), Some(content)) = (&message.role, &message.content) else {
            continue;
        };
        if let MessageContent::Other(value) = content {
            debug!(role = %role, kind = json_kind(value), "skipping message with unsupported content");
            continue;
        }

        if !no_role_prefix {
            prompt.text.push_str(role_prefix(role));
        }

        match content {
            MessageContent::Text(text) => {
                prompt.text.push_str(text);
                prompt.text.push_str("\n\n");
            }
            MessageContent::Parts(parts) => {
                for part in parts {
                    match part.kind.as_str() {
                        "text" => {
                            if let Some(text) = &part.text {
                                prompt.text.push_str(text);
                                prompt.text.push_str("\n\n");
                            }
                        }
                        "image_url" => {
                            if let Some(image) = &part.image_url {
                                prompt.images.push(image_attachment(&image.url));
                            }
                        }
                        _ => {}
                    }
                }
            }
            MessageContent::Other(_) => {}
        }
    }

    prompt
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// `data:image/...;base64,<payload>` keeps the payload; anything else is a
/// remote URL.
fn image_attachment(url: &str) -> Attachment {
    if url.starts_with("data:image/")
        && let Some((_, payload)) = url.split_once(',')
    {
        return Attachment::Inline(payload.to_string());
    }
    Attachment::Remote(url.to_string())
}
