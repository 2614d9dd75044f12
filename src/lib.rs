//! # chatpool
//!
//! Concurrent completion of conversation documents:
//! - Conversation parsing and lossless rendering of chat documents
//! - Completion clients for OpenAI-compatible endpoints and AWS Bedrock
//! - A retrying task runner with per-call timeouts and exponential backoff
//! - A file scheduler that completes every conversation of a document under a concurrency cap
//! - A pool watcher that keeps completing files dropped into a directory
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chatpool::{CompletionSettings, FileCompletionScheduler, KeySource, KeyedClient, OpenAiClient};
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OpenAiClient::from_key_source(&KeySource::from_env("OPENAI_API_KEY"))?;
//!     let scheduler = FileCompletionScheduler::new(Arc::new(client));
//!
//!     let settings = CompletionSettings {
//!         model: "gpt-4o-mini".to_string(),
//!         retries: 2,
//!         max_concurrent: Some(4),
//!         ..Default::default()
//!     };
//!
//!     let result = scheduler
//!         .complete_file(Path::new("notes.chat"), None, &settings, &CancellationToken::new())
//!         .await?;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```

// Include the modules from the modules directory
#[path = "../modules/mod.rs"]
pub mod modules;

// Re-export everything from modules for easy access
pub use modules::*;

pub use anyhow::{Context, Result};
pub use tokio;
pub use tokio_util::sync::CancellationToken;
pub use tracing;

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library information
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
