//! Ask request shaping
//!
//! `Query` is what the gateway decides per attempt; `AskRequest` is the exact
//! JSON body the web frontend posts to the ask endpoint. Fresh identifiers
//! are generated for every request.

use serde::Serialize;
use uuid::Uuid;

use crate::constants::{API_VERSION, SUPPORTED_BLOCK_USE_CASES};

/// One upstream question, fully resolved by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub prompt: String,
    /// Upstream model id (already mapped from the public name).
    pub model: String,
    pub search: bool,
    pub incognito: bool,
    /// Attachment references returned by uploads with the same session.
    pub attachments: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AskRequest {
    pub params: AskParams,
    pub query_str: String,
}

#[derive(Debug, Serialize)]
pub struct AskParams {
    pub attachments: Vec<String>,
    pub language: &'static str,
    pub timezone: &'static str,
    pub search_focus: &'static str,
    pub sources: Vec<&'static str>,
    pub search_recency_filter: Option<String>,
    pub frontend_uuid: String,
    pub mode: &'static str,
    pub model_preference: String,
    pub is_related_query: bool,
    pub is_sponsored: bool,
    pub visitor_id: String,
    pub user_nextauth_id: String,
    pub frontend_context_uuid: String,
    pub prompt_source: &'static str,
    pub query_source: &'static str,
    pub browser_history_summary: Vec<String>,
    pub is_incognito: bool,
    pub use_schematized_api: bool,
    pub send_back_text_in_streaming_api: bool,
    pub supported_block_use_cases: &'static [&'static str],
    pub client_coordinates: Option<String>,
    pub is_nav_suggestions_disabled: bool,
    pub version: &'static str,
}

impl AskRequest {
    pub fn new(query: &Query) -> Self {
        let (search_focus, sources) = if query.search {
            ("internet", vec!["web"])
        } else {
            ("writing", Vec::new())
        };

        Self {
            params: AskParams {
                attachments: query.attachments.clone(),
                language: "en-US",
                timezone: "America/New_York",
                search_focus,
                sources,
                search_recency_filter: None,
                frontend_uuid: Uuid::new_v4().to_string(),
                mode: "copilot",
                model_preference: query.model.clone(),
                is_related_query: false,
                is_sponsored: false,
                visitor_id: Uuid::new_v4().to_string(),
                user_nextauth_id: Uuid::new_v4().to_string(),
                frontend_context_uuid: Uuid::new_v4().to_string(),
                prompt_source: "user",
                query_source: "home",
                browser_history_summary: Vec::new(),
                is_incognito: query.incognito,
                use_schematized_api: true,
                send_back_text_in_streaming_api: false,
                supported_block_use_cases: SUPPORTED_BLOCK_USE_CASES,
                client_coordinates: None,
                is_nav_suggestions_disabled: false,
                version: API_VERSION,
            },
            query_str: query.prompt.clone(),
        }
    }
}
