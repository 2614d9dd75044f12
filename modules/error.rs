//! Error types for failures that abort a whole File Task

use std::path::PathBuf;
use thiserror::Error;

/// Location of a malformed construct inside a document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    /// 1-based line number
    pub line: usize,
    pub message: String,
}

/// Errors raised before any job is dispatched, or while persisting the result
#[derive(Debug, Error)]
pub enum ChatpoolError {
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ChatpoolError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

pub type ChatpoolResult<T> = std::result::Result<T, ChatpoolError>;
