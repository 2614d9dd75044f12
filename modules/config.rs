//! Settings for completion runs, the pool watcher and client construction.
//! Loaded from an optional JSON file; command-line flags are applied on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::modules::completion_client::openai::DEFAULT_BASE_URL;
use crate::modules::completion_client::{KeySource, KeyedClient, OpenAiClient, Vendor};
use crate::modules::conversation::ParseConfig;
use crate::modules::error::{ChatpoolError, ChatpoolResult};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RETRIES: u32 = 4;
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_MAX_FILES: usize = 2;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 3600;

/// Per-file completion parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    /// Model used for units without a `:model` override
    pub model: String,
    pub timeout_secs: u64,
    /// Retries after the first attempt
    pub retries: u32,
    /// Jobs in flight per file; `None` picks the default
    pub max_concurrent: Option<usize>,
    /// Inferred from the model when unset
    pub vendor: Option<Vendor>,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
            max_concurrent: None,
            vendor: None,
        }
    }
}

impl CompletionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT)
    }

    pub fn validate(&self) -> ChatpoolResult<()> {
        if self.model.trim().is_empty() {
            return Err(ChatpoolError::config("model must not be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(ChatpoolError::config("timeout must be at least one second"));
        }
        if self.max_concurrent == Some(0) {
            return Err(ChatpoolError::config("max_concurrent must be positive"));
        }
        Ok(())
    }

    pub fn vendor(&self) -> ChatpoolResult<Vendor> {
        Vendor::resolve(self.vendor, &self.model)
    }
}

/// Directory watching parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Files completed at once; `None` picks the default
    pub max_files: Option<usize>,
    pub poll_interval_secs: u64,
    pub status_interval_secs: u64,
    /// Accepted file extensions, without the dot
    pub extensions: Vec<String>,
    /// Write results here instead of rewriting files in place
    pub out_dir: Option<PathBuf>,
    /// Complete a done file again once it changes
    pub reprocess_on_change: bool,
    /// Watch `<dir>/in`, complete through `<dir>/.cache` into `out_dir`
    /// (default `<dir>/out`)
    pub staged: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_files: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            status_interval_secs: DEFAULT_STATUS_INTERVAL_SECS,
            extensions: vec!["chat".to_string(), "txt".to_string()],
            out_dir: None,
            reprocess_on_change: false,
            staged: false,
        }
    }
}

impl PoolSettings {
    pub fn file_limit(&self) -> usize {
        self.max_files.unwrap_or(DEFAULT_MAX_FILES)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn validate(&self) -> ChatpoolResult<()> {
        if self.max_files == Some(0) {
            return Err(ChatpoolError::config("max_files must be positive"));
        }
        if self.poll_interval_secs == 0 || self.status_interval_secs == 0 {
            return Err(ChatpoolError::config("poll and status intervals must be at least one second"));
        }
        if self.extensions.iter().any(|e| e.trim_start_matches('.').is_empty()) {
            return Err(ChatpoolError::config("file extensions must not be empty"));
        }
        Ok(())
    }
}

/// Client construction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_key: Option<String>,
    pub api_key_file: Option<PathBuf>,
    /// Environment variable holding the key, also its name inside the key file
    pub api_key_env: String,
    pub base_url: String,
    pub aws_region: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_file: None,
            api_key_env: OpenAiClient::KEY_ENV.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            aws_region: None,
        }
    }
}

impl ClientSettings {
    pub fn key_source(&self) -> KeySource {
        KeySource::new(self.api_key.clone(), self.api_key_file.clone(), self.api_key_env.clone())
    }
}

/// Everything the binary needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub completion: CompletionSettings,
    pub pool: PoolSettings,
    pub client: ClientSettings,
    /// Document syntax, currently the unit separator
    pub document: ParseConfig,
}

impl AppConfig {
    /// Defaults, or the contents of `path` when given. Missing fields keep their defaults.
    pub fn load(path: Option<&Path>) -> ChatpoolResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|source| ChatpoolError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ChatpoolError::config(format!("invalid config file {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> ChatpoolResult<()> {
        self.completion.validate()?;
        self.pool.validate()?;
        self.document.validate().map_err(ChatpoolError::Configuration)
    }
}
