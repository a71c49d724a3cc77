//! Upstream event decoding
//!
//! Each `data: ` line of the ask stream carries one JSON event with a list of
//! heterogeneous blocks. A block is an object with one of several optional
//! keys; it is decoded into the `Block` sum type by checking the keys in a
//! fixed priority order (reasoning, markdown, web results, images). Blocks of
//! any other kind decode to `Block::None` and are ignored downstream.
//!
//! Upstream sends `null` for empty lists and strings freely, so every field is
//! decoded leniently.

use serde::{Deserialize, Deserializer};

use crate::constants::{DATA_PREFIX, STATUS_COMPLETED};

/// One decoded event from the ask stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AskEvent {
    #[serde(default, deserialize_with = "nullable")]
    pub blocks: Vec<Block>,
    #[serde(default, deserialize_with = "nullable")]
    pub status: String,
    /// Upstream id of the model that actually served the answer.
    #[serde(default, deserialize_with = "nullable")]
    pub display_model: String,
}

impl AskEvent {
    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawBlock")]
pub enum Block {
    /// Planning goals shown as the reasoning region.
    Reasoning(Vec<Goal>),
    /// Answer text chunks.
    Markdown(Vec<String>),
    WebResults(Vec<WebResult>),
    Images(ImageBlock),
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Goal {
    #[serde(default, deserialize_with = "nullable")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WebResult {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub snippet: String,
    #[serde(default, deserialize_with = "nullable")]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ImageBlock {
    #[serde(default, deserialize_with = "nullable")]
    pub progress: String,
    #[serde(default, deserialize_with = "nullable")]
    pub media_items: Vec<MediaItem>,
}

impl ImageBlock {
    /// Image generation finished and produced at least one item.
    pub fn is_done(&self) -> bool {
        self.progress == "DONE" && !self.media_items.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MediaItem {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub image: String,
    #[serde(default, deserialize_with = "nullable")]
    pub url: String,
}

#[derive(Deserialize)]
struct RawBlock {
    reasoning_plan_block: Option<RawReasoning>,
    markdown_block: Option<RawMarkdown>,
    web_result_block: Option<RawWebResults>,
    image_mode_block: Option<ImageBlock>,
}

#[derive(Deserialize)]
struct RawReasoning {
    #[serde(default, deserialize_with = "nullable")]
    goals: Vec<Goal>,
}

#[derive(Deserialize)]
struct RawMarkdown {
    #[serde(default, deserialize_with = "nullable")]
    chunks: Vec<String>,
}

#[derive(Deserialize)]
struct RawWebResults {
    #[serde(default, deserialize_with = "nullable")]
    web_results: Vec<WebResult>,
}

impl From<RawBlock> for Block {
    fn from(raw: RawBlock) -> Self {
        if let Some(r) = raw.reasoning_plan_block {
            Block::Reasoning(r.goals)
        } else if let Some(m) = raw.markdown_block {
            Block::Markdown(m.chunks)
        } else if let Some(w) = raw.web_result_block {
            Block::WebResults(w.web_results)
        } else if let Some(i) = raw.image_mode_block {
            Block::Images(i)
        } else {
            Block::None
        }
    }
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decode one event-stream line.
///
/// Returns `None` for lines without the `data: ` prefix, otherwise the parse
/// result of the payload.
pub fn parse_event_line(line: &str) -> Option<Result<AskEvent, serde_json::Error>> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    Some(serde_json::from_str(payload))
}
