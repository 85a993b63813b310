//! Configuration for Chatmem
//!
//! Resolution order (later wins):
//!   1. built-in defaults
//!   2. `{home}/config.toml`
//!   3. environment (`CHATMEM_MODEL`, `OPENAI_BASE_URL`, API key env var)
//!   4. CLI flags, applied by the caller through the `with_*` builders

use crate::memory::{MemoryOptions, TokenMeasure};
use crate::{ChatmemError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default chat model, same as the one the summary prompt was tuned on
pub const DEFAULT_MODEL: &str = "gpt-4-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
/// Input line that ends the interactive loop
pub const DEFAULT_SENTINEL: &str = "q";
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 4;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// `config.toml` contents. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    /// Model used for replies
    model: Option<String>,

    /// Model used for summarization; falls back to `model`
    summary_model: Option<String>,

    /// OpenAI-compatible API base URL
    base_url: Option<String>,

    /// Name of the environment variable holding the API key
    api_key_env: Option<String>,

    /// Buffer threshold, measured with `measure`
    max_tokens: Option<usize>,

    /// Keep evicting until the buffer fits instead of once per turn
    evict_until_under_threshold: Option<bool>,

    /// "chars" or "approx_tokens"
    measure: Option<TokenMeasure>,

    sentinel: Option<String>,

    max_retry_attempts: Option<u32>,

    request_timeout_secs: Option<u64>,
}

/// Configuration for Chatmem
#[derive(Debug, Clone)]
pub struct ChatmemConfig {
    /// Directory holding `config.toml` and `sessions/`
    pub home: PathBuf,

    /// Model used for streamed replies
    pub model: String,

    /// Model used for the summarization step; `None` follows `model`
    pub summary_model: Option<String>,

    pub base_url: String,

    /// Environment variable the API key is read from
    pub api_key_env: String,

    pub api_key: Option<String>,

    /// Buffer threshold and eviction policy
    pub memory: MemoryOptions,

    pub sentinel: String,

    /// Total attempts per LLM request (1 = no retry)
    pub max_retry_attempts: u32,

    pub request_timeout: Duration,
}

impl ChatmemConfig {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            model: DEFAULT_MODEL.to_string(),
            summary_model: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            api_key: None,
            memory: MemoryOptions::default(),
            sentinel: DEFAULT_SENTINEL.to_string(),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Load configuration from `{home}/config.toml` and the environment.
    ///
    /// A missing config file is not an error; an unparseable one is.
    pub async fn load(home: &Path) -> Result<Self> {
        Self::load_file(home, &home.join("config.toml")).await
    }

    /// Like [`ChatmemConfig::load`], reading an explicit config file path.
    pub async fn load_file(home: &Path, config_file: &Path) -> Result<Self> {
        let mut config = Self::new(home.to_path_buf());

        if config_file.exists() {
            let content = tokio::fs::read_to_string(config_file).await?;
            config = config.merge_toml(&content).map_err(|e| match e {
                ChatmemError::Config(msg) => {
                    ChatmemError::Config(format!("{}: {}", config_file.display(), msg))
                }
                other => other,
            })?;
            info!("Loaded config from {}", config_file.display());
        } else {
            debug!("No config file at {}, using defaults", config_file.display());
        }

        config.apply_env();
        Ok(config)
    }

    /// Merge `config.toml` contents over the current values.
    pub fn merge_toml(mut self, content: &str) -> Result<Self> {
        let file: ConfigToml =
            toml::from_str(content).map_err(|e| ChatmemError::Config(e.to_string()))?;

        if let Some(model) = file.model {
            self.model = model;
        }
        if let Some(summary_model) = file.summary_model {
            self.summary_model = Some(summary_model);
        }
        if let Some(base_url) = file.base_url {
            self.base_url = base_url;
        }
        if let Some(env_key) = file.api_key_env {
            self.api_key_env = env_key;
        }
        if let Some(max_tokens) = file.max_tokens {
            self.memory.max_size_tokens = max_tokens;
        }
        if let Some(evict) = file.evict_until_under_threshold {
            self.memory.evict_until_under_threshold = evict;
        }
        if let Some(measure) = file.measure {
            self.memory.measure = measure;
        }
        if let Some(sentinel) = file.sentinel {
            self.sentinel = sentinel;
        }
        if let Some(attempts) = file.max_retry_attempts {
            self.max_retry_attempts = attempts;
        }
        if let Some(secs) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(secs);
        }

        Ok(self)
    }

    /// Apply environment overrides.
    fn apply_env(&mut self) {
        if let Ok(model) = std::env::var("CHATMEM_MODEL") {
            self.model = model;
        }
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            self.base_url = base_url;
        }
        if let Ok(key) = std::env::var(&self.api_key_env) {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_summary_model(mut self, model: String) -> Self {
        self.summary_model = Some(model);
        self
    }

    /// Model the summarization step runs on, resolved after every layer so a
    /// reply model set from the environment or CLI is followed too.
    pub fn effective_summary_model(&self) -> &str {
        self.summary_model.as_deref().unwrap_or(&self.model)
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.memory.max_size_tokens = max_tokens;
        self
    }

    pub fn with_evict_until_under_threshold(mut self, enabled: bool) -> Self {
        self.memory.evict_until_under_threshold = enabled;
        self
    }

    pub fn with_measure(mut self, measure: TokenMeasure) -> Self {
        self.memory.measure = measure;
        self
    }

    pub fn with_sentinel(mut self, sentinel: String) -> Self {
        self.sentinel = sentinel;
        self
    }

    /// Directory session snapshots are written to
    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    /// Reject settings the memory manager cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        if self.max_retry_attempts == 0 {
            return Err(ChatmemError::InvalidArgument(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.sentinel.trim().is_empty() {
            return Err(ChatmemError::InvalidArgument(
                "sentinel must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the Chatmem home directory: `$CHATMEM_HOME` or `~/.chatmem`.
pub fn default_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("CHATMEM_HOME") {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir()
        .ok_or_else(|| ChatmemError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".chatmem"))
}
