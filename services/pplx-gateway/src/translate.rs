//! Upstream event stream to assistant text
//!
//! `Translator` is the per-response state machine. It is fed one line at a
//! time and returns the text deltas that line produced, in emission order.
//! It never does I/O: the relay decides whether deltas are streamed out or
//! only accumulated.
//!
//! Per non-terminal event, reasoning blocks are handled before markdown
//! blocks. Reasoning text is wrapped in a synthetic `<think>` region that is
//! opened at most once and closed at most once per response. The terminal
//! event appends image listings, then search results, then a note when the
//! serving model differs from the requested one, and finishes the response.

use pplx_client::{AskEvent, Block, ImageBlock, WebResult, parse_event_line};
use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::models::display_name;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>\n";

/// Goal descriptions the upstream emits around every plan.
const BOILERPLATE_GOALS: &[&str] = &["Beginning analysis", "Wrapping up analysis"];

const SNIPPET_MAX_CHARS: usize = 150;
const SNIPPET_ELLIPSIS: &str = " ……";
const SECTION_RULE: &str = "\n\n---\n";

/// Output switches taken from the chat configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslateOptions {
    pub ignore_search_result: bool,
    pub search_result_compatible: bool,
    pub ignore_model_monitoring: bool,
}

impl From<&ChatConfig> for TranslateOptions {
    fn from(chat: &ChatConfig) -> Self {
        Self {
            ignore_search_result: chat.ignore_search_result,
            search_result_compatible: chat.search_result_compatible,
            ignore_model_monitoring: chat.ignore_model_monitoring,
        }
    }
}

pub struct Translator {
    options: TranslateOptions,
    /// Upstream id the request asked for.
    requested_model: String,
    full_text: String,
    thinking_open: bool,
    thinking_shown: bool,
    finished: bool,
}

impl Translator {
    pub fn new(requested_model: impl Into<String>, options: TranslateOptions) -> Self {
        Self {
            options,
            requested_model: requested_model.into(),
            full_text: String::new(),
            thinking_open: false,
            thinking_shown: false,
            finished: false,
        }
    }

    /// Terminal event seen; later lines are ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn into_text(self) -> String {
        self.full_text
    }

    /// Feed one raw line. Lines without the data prefix and malformed
    /// payloads produce nothing.
    pub fn feed_line(&mut self, line: &str) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        match parse_event_line(line) {
            None => Vec::new(),
            Some(Err(e)) => {
                warn!(error = %e, "skipping malformed event line");
                Vec::new()
            }
            Some(Ok(event)) => self.feed_event(&event),
        }
    }

    pub fn feed_event(&mut self, event: &AskEvent) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }

        let mut deltas = Vec::new();
        if event.is_completed() {
            self.finish(event, &mut deltas);
            return deltas;
        }

        for block in &event.blocks {
            if let Block::Reasoning(goals) = block
                && goals.iter().any(|g| !g.description.is_empty())
            {
                let mut text = String::new();
                if !self.thinking_open && !self.thinking_shown {
                    text.push_str(THINK_OPEN);
                    self.thinking_open = true;
                }
                for goal in goals {
                    let description = goal.description.as_str();
                    if !description.is_empty() && !BOILERPLATE_GOALS.contains(&description) {
                        text.push_str(description);
                    }
                }
                self.emit(text, &mut deltas);
            }
        }

        for block in &event.blocks {
            if let Block::Markdown(chunks) = block
                && chunks.iter().any(|c| !c.is_empty())
            {
                let mut text = String::new();
                if self.thinking_open {
                    text.push_str(THINK_CLOSE);
                    self.thinking_open = false;
                    self.thinking_shown = true;
                }
                for chunk in chunks {
                    text.push_str(chunk);
                }
                self.emit(text, &mut deltas);
            }
        }

        deltas
    }

    fn finish(&mut self, event: &AskEvent, deltas: &mut Vec<String>) {
        for block in &event.blocks {
            if let Block::Images(images) = block
                && images.is_done()
            {
                self.emit(format_images(images), deltas);
            }
        }

        if !self.options.ignore_search_result {
            for block in &event.blocks {
                if let Block::WebResults(results) = block
                    && !results.is_empty()
                {
                    let mut text = String::from(SECTION_RULE);
                    for (i, result) in results.iter().enumerate() {
                        text.push_str("\n\n");
                        text.push_str(&format_search_result(
                            i + 1,
                            result,
                            self.options.search_result_compatible,
                        ));
                    }
                    self.emit(text, deltas);
                }
            }
        }

        if !self.options.ignore_model_monitoring
            && !event.display_model.is_empty()
            && event.display_model != self.requested_model
        {
            debug!(
                requested = %self.requested_model,
                served = %event.display_model,
                "upstream served a different model"
            );
            self.emit(
                format!(
                    "{SECTION_RULE}Display Model: {}\n",
                    display_name(&event.display_model)
                ),
                deltas,
            );
        }

        self.finished = true;
    }

    fn emit(&mut self, text: String, deltas: &mut Vec<String>) {
        if text.is_empty() {
            return;
        }
        self.full_text.push_str(&text);
        deltas.push(text);
    }
}

fn format_images(images: &ImageBlock) -> String {
    let mut text = String::new();
    for item in &images.media_items {
        text.push_str(&format!("![{}]({})\n", item.name, item.image));
    }
    let names: Vec<&str> = images.media_items.iter().map(|i| i.name.as_str()).collect();
    text.push_str(SECTION_RULE);
    text.push_str(&names.join(", "));
    text
}

/// Format one search result. `index` is 1-based.
pub fn format_search_result(index: usize, result: &WebResult, compatible: bool) -> String {
    let snippet = truncate_snippet(&result.snippet);
    if compatible {
        format!("[{index}] [{}]({}):\n{snippet}\n", result.name, result.url)
    } else {
        format!(
            "<details>\n<summary>[{index}] {}</summary>\n\n{snippet}\n\n[Link]({})\n\n</details>",
            result.name, result.url
        )
    }
}

/// Cut snippets longer than 150 code points and mark the cut.
pub fn truncate_snippet(snippet: &str) -> String {
    match snippet.char_indices().nth(SNIPPET_MAX_CHARS) {
        Some((cut, _)) => format!("{}{SNIPPET_ELLIPSIS}", &snippet[..cut]),
        None => snippet.to_string(),
    }
}
