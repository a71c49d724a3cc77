//! Upstream endpoint and wire constants
//!
//! These mirror what the Perplexity web frontend sends. They identify the
//! public web client and are not secrets; the session token is the only
//! credential and is handled by the session pool.

/// Web frontend origin. All REST paths below are relative to it.
pub const DEFAULT_BASE_URL: &str = "https://www.perplexity.ai";

/// Cloudinary upload API root; the cloud name and `image/upload` are appended.
pub const DEFAULT_CLOUDINARY_URL: &str = "https://api.cloudinary.com/v1_1";

/// S3 bucket receiving text attachments.
pub const DEFAULT_S3_URL: &str = "https://ppl-ai-file-upload.s3.amazonaws.com/";

/// Cookie carrying the session token on every upstream call.
pub const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

pub const ASK_PATH: &str = "/rest/sse/perplexity_ask";
pub const UPLOAD_URL_PATH: &str = "/rest/uploads/create_upload_url?version=2.18&source=default";
pub const SESSION_PATH: &str = "/api/auth/session";

/// Uploaded images are referenced through the private CDN path, not the
/// `secure_url` Cloudinary returns.
pub const PRIVATE_IMAGE_PREFIX: &str = "https://pplx-res.cloudinary.com/image/private";
pub const USER_UPLOADS_MARKER: &str = "/user_uploads";

pub const API_VERSION: &str = "2.18";

/// Block kinds the gateway asks the upstream to send.
pub const SUPPORTED_BLOCK_USE_CASES: &[&str] = &[
    "answer_modes",
    "media_items",
    "knowledge_cards",
    "inline_entity_cards",
    "place_widgets",
    "finance_widgets",
    "sports_widgets",
    "shopping_widgets",
    "jobs_widgets",
    "search_result_widgets",
    "entity_list_answer",
    "todo_list",
];

/// Headers the web frontend sends on every request.
pub const COMMON_HEADERS: &[(&str, &str)] = &[
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
    ("origin", "https://www.perplexity.ai"),
    ("pragma", "no-cache"),
    ("priority", "u=1, i"),
    ("referer", "https://www.perplexity.ai/"),
];

/// Event-stream line prefix. Lines without it are keep-alives or noise.
pub const DATA_PREFIX: &str = "data: ";

/// `status` value of the terminal event.
pub const STATUS_COMPLETED: &str = "COMPLETED";

/// Longest accepted event-stream line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
