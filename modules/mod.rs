//! Library for completing conversation documents
//!
//! This library provides modules for:
//! - Parsing and rendering conversation documents
//! - Completion clients for OpenAI-compatible endpoints and AWS Bedrock
//! - Retrying task runner with timeouts and backoff
//! - File scheduler completing one document under a concurrency cap
//! - Pool watcher completing files dropped into a directory

pub mod error;
pub mod config;
pub mod conversation;
pub mod completion_client;
pub mod task_runner;
pub mod file_scheduler;
pub mod pool_watcher;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types and structs
pub use error::{ChatpoolError, ChatpoolResult, ParseError};
pub use config::{AppConfig, ClientSettings, CompletionSettings, PoolSettings};
pub use conversation::{
    ConversationDocument, ConversationParser, ConversationUnit, FailureKind, LineEnding, ParseConfig, UnitStatus,
};
pub use completion_client::{
    BedrockClient, CompletionClient, CompletionError, CompletionRequest, KeySource, KeyedClient, OpenAiClient, Vendor,
};
pub use task_runner::{BackoffPolicy, CompletionJob, Outcome, RetryingTaskRunner};
pub use file_scheduler::{AggregateStatus, FileCompletionScheduler, FileTaskResult};
pub use pool_watcher::{
    watch_pool_files, EntryState, ExtensionFilter, FileFilter, OutputTarget, PoolEntry, PoolSummary, PoolWatcher,
};
