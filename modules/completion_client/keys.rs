//! API key resolution: explicit value, then key file, then environment variable

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::modules::error::{ChatpoolError, ChatpoolResult};

/// Separators accepted between the key name and its value in a key file
const NAME_VALUE_SEPS: &[char] = &['=', ' ', ':'];

/// Where to look for an API key. The first source that yields a value wins.
#[derive(Debug, Clone, Default)]
pub struct KeySource {
    pub explicit: Option<String>,
    pub file: Option<PathBuf>,
    /// Environment variable name, also the key name looked up in `file`
    pub env_var: String,
}

impl KeySource {
    pub fn new(explicit: Option<String>, file: Option<PathBuf>, env_var: impl Into<String>) -> Self {
        Self {
            explicit,
            file,
            env_var: env_var.into(),
        }
    }

    pub fn from_env(env_var: impl Into<String>) -> Self {
        Self::new(None, None, env_var)
    }

    /// Resolve against the process environment
    pub fn resolve(&self) -> ChatpoolResult<String> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve with an injected environment lookup
    pub fn resolve_with(&self, env: impl Fn(&str) -> Option<String>) -> ChatpoolResult<String> {
        if let Some(key) = self.explicit.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            debug!("Using explicit API key");
            return Ok(key.to_string());
        }

        if let Some(file) = &self.file {
            if let Some(key) = read_key_file(file, &self.env_var)? {
                debug!("Using API key from file {}", file.display());
                return Ok(key);
            }
        }

        if let Some(key) = env(&self.env_var).map(|k| k.trim().to_string()).filter(|k| !k.is_empty()) {
            debug!("Using API key from environment variable {}", self.env_var);
            return Ok(key);
        }

        Err(ChatpoolError::config(format!(
            "no API key found: pass one explicitly, through a key file, or set {}",
            self.env_var
        )))
    }
}

/// Read `NAME=value` (or a lone key line) from a key file
fn read_key_file(path: &Path, name: &str) -> ChatpoolResult<Option<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ChatpoolError::config(format!("cannot read API key file {}: {}", path.display(), e))
    })?;

    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();

    for line in &lines {
        if let Some(rest) = line.strip_prefix(name) {
            if rest.starts_with(NAME_VALUE_SEPS) {
                let value = rest.trim_start_matches(NAME_VALUE_SEPS).trim();
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
            }
        }
    }

    match lines.as_slice() {
        [single] if !single.contains(NAME_VALUE_SEPS) => Ok(Some(single.to_string())),
        _ => Ok(None),
    }
}

/// A client built from a resolved API key
pub trait KeyedClient: Sized {
    /// Environment variable (and key file entry) holding the key
    const KEY_ENV: &'static str;

    fn with_api_key(api_key: String) -> ChatpoolResult<Self>;

    fn from_key_source(source: &KeySource) -> ChatpoolResult<Self> {
        Self::with_api_key(source.resolve()?)
    }
}
