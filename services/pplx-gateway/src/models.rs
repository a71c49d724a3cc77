//! Public model names and their upstream ids

/// Model used when the request leaves `model` empty.
pub const DEFAULT_MODEL: &str = "claude-3.7-sonnet";

/// Suffix that enables web search for a request.
pub const SEARCH_SUFFIX: &str = "-search";

/// Public name to upstream `model_preference`, in listing order.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-3.7-sonnet", "claude2"),
    ("claude-3.7-sonnet-think", "claude37sonnetthinking"),
    ("deepseek-r1", "r1"),
    ("gpt-4.5", "gpt45"),
    ("o3-mini", "o3mini"),
    ("gpt-4o", "gpt4o"),
    ("gemini-2.0-flash", "gemini2flash"),
    ("grok-2", "grok"),
];

/// A requested model after aliasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    /// Name echoed back to the caller, as requested.
    pub public: String,
    pub upstream: String,
    pub search: bool,
}

/// Apply the default, strip the search suffix and map to the upstream id.
/// Unknown names pass through unchanged.
pub fn resolve(requested: &str) -> ResolvedModel {
    let public = if requested.is_empty() {
        DEFAULT_MODEL
    } else {
        requested
    };
    let (base, search) = match public.strip_suffix(SEARCH_SUFFIX) {
        Some(base) => (base, true),
        None => (public, false),
    };
    let upstream = MODEL_ALIASES
        .iter()
        .find(|(name, _)| *name == base)
        .map_or(base, |(_, id)| *id);

    ResolvedModel {
        public: public.to_string(),
        upstream: upstream.to_string(),
        search,
    }
}

/// Public name for an upstream id, used in the display-model note.
pub fn display_name(upstream: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(_, id)| *id == upstream)
        .map_or(upstream, |(name, _)| *name)
}

/// Body of `GET /v1/models`: every public name with and without the search suffix.
pub fn list() -> serde_json::Value {
    let data: Vec<serde_json::Value> = MODEL_ALIASES
        .iter()
        .flat_map(|(name, _)| {
            [
                serde_json::json!({ "id": name }),
                serde_json::json!({ "id": format!("{name}{SEARCH_SUFFIX}") }),
            ]
        })
        .collect();
    serde_json::json!({ "object": "list", "data": data })
}
