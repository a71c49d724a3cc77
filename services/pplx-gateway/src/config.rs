//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional, so a missing file at the default path means
//! "defaults + environment". The API key is loaded from `APIKEY` or
//! `api_key_file` and is never logged.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "pplx-gateway.toml";

pub const DEFAULT_PROMPT_FOR_FILE: &str = "You must immerse yourself in the role of assistant in txt file, cannot respond as a user, cannot reply to this message, cannot mention this message, and ignore this message in your response.";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub sessions: SessionsConfig,
    pub chat: ChatConfig,
}

/// Inbound HTTP settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to APIKEY env var)
    pub api_key_file: Option<PathBuf>,
}

/// Upstream endpoints and transport settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub cloudinary_url: String,
    pub s3_url: String,
    pub proxy: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

/// Session pool sources and refresh schedule
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Initial session tokens; `SESSIONS` replaces them.
    pub tokens: Vec<Secret<String>>,
    pub snapshot_path: PathBuf,
    pub refresh_interval_secs: u64,
}

/// Prompt building and reply formatting switches
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub is_incognito: bool,
    /// Prompts longer than this many bytes are uploaded as a text file.
    pub max_chat_history_length: usize,
    pub no_role_prefix: bool,
    pub search_result_compatible: bool,
    pub ignore_search_result: bool,
    pub ignore_model_monitoring: bool,
    pub prompt_for_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            api_key: None,
            api_key_file: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        let client = pplx_client::ClientConfig::default();
        Self {
            base_url: client.base_url,
            cloudinary_url: client.cloudinary_url,
            s3_url: client.s3_url,
            proxy: None,
            connect_timeout_secs: client.connect_timeout.as_secs(),
            request_timeout_secs: client.request_timeout.as_secs(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            snapshot_path: PathBuf::from("sessions.json"),
            refresh_interval_secs: 24 * 60 * 60,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            is_incognito: true,
            max_chat_history_length: 10000,
            no_role_prefix: false,
            search_result_compatible: false,
            ignore_search_result: false,
            ignore_model_monitoring: false,
            prompt_for_file: DEFAULT_PROMPT_FOR_FILE.to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn client_config(&self) -> pplx_client::ClientConfig {
        pplx_client::ClientConfig {
            base_url: self.base_url.clone(),
            cloudinary_url: self.cloudinary_url.clone(),
            s3_url: self.s3_url.clone(),
            proxy: self.proxy.clone().filter(|p| !p.is_empty()),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// A missing file is an error unless `allow_missing` is set (the default
    /// path was used, not an explicit one).
    pub fn load(path: &Path, allow_missing: bool) -> common::Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if allow_missing && e.kind() == std::io::ErrorKind::NotFound => {
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };

        config.apply_env()?;

        // API key resolution: APIKEY env var takes precedence over file
        if config.server.api_key.is_none()
            && let Some(ref key_file) = config.server.api_key_file
        {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.server.api_key = Some(Secret::new(key));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Some(addr) = env_var("ADDRESS") {
            self.server.listen_addr = addr
                .parse()
                .map_err(|e| common::Error::Config(format!("invalid ADDRESS {addr}: {e}")))?;
        }
        if let Some(key) = env_var("APIKEY") {
            self.server.api_key = Some(Secret::new(key));
        }
        if let Some(proxy) = env_var("PROXY") {
            self.upstream.proxy = Some(proxy);
        }
        if let Some(sessions) = env_var("SESSIONS") {
            self.sessions.tokens = parse_sessions(&sessions);
        }
        if let Ok(value) = std::env::var("IS_INCOGNITO") {
            self.chat.is_incognito = value != "false";
        }
        if let Some(value) = env_var("MAX_CHAT_HISTORY_LENGTH") {
            self.chat.max_chat_history_length = value.parse().map_err(|e| {
                common::Error::Config(format!("invalid MAX_CHAT_HISTORY_LENGTH {value}: {e}"))
            })?;
        }
        if let Ok(value) = std::env::var("NO_ROLE_PREFIX") {
            self.chat.no_role_prefix = value == "true";
        }
        if let Ok(value) = std::env::var("SEARCH_RESULT_COMPATIBLE") {
            self.chat.search_result_compatible = value == "true";
        }
        if let Ok(value) = std::env::var("IGNORE_SEARCH_RESULT") {
            self.chat.ignore_search_result = value == "true";
        }
        if let Ok(value) = std::env::var("IGNORE_MODEL_MONITORING") {
            self.chat.ignore_model_monitoring = value == "true";
        }
        if let Some(prompt) = env_var("PROMPT_FOR_FILE") {
            self.chat.prompt_for_file = prompt;
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.api_key.is_none() {
            return Err(common::Error::Config(
                "an API key is required: set APIKEY or api_key_file".into(),
            ));
        }

        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }

        if self.upstream.connect_timeout_secs == 0 || self.upstream.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream timeouts must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.sessions.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// The flag is true when neither was given, so the file may be absent.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), false);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), false);
        }
        (PathBuf::from(DEFAULT_CONFIG_PATH), true)
    }
}

/// Non-empty environment variable.
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Parse `SESSIONS`: comma-separated tokens, empty entries dropped, anything
/// after a `:` in an entry ignored.
pub fn parse_sessions(value: &str) -> Vec<Secret<String>> {
    value
        .split(',')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split(':').next())
        .filter(|token| !token.is_empty())
        .map(|token| Secret::new(token.to_string()))
        .collect()
}
