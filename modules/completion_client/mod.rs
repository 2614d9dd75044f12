//! Completion clients
//!
//! The scheduling core only sees the [`CompletionClient`] capability and the
//! [`CompletionError`] taxonomy. Each vendor gets one implementation:
//! - [`OpenAiClient`] for OpenAI-compatible chat completion endpoints
//! - [`BedrockClient`] for AWS Bedrock hosted models

pub mod keys;
pub mod openai;
pub mod bedrock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::modules::conversation::{ConversationUnit, Message, UnitOptions};
use crate::modules::error::{ChatpoolError, ChatpoolResult};

pub use bedrock::BedrockClient;
pub use keys::{KeySource, KeyedClient};
pub use openai::OpenAiClient;

/// Remote service a model is served by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAi,
    Bedrock,
}

impl Vendor {
    /// Guess the vendor from a model identifier
    pub fn for_model(model: &str) -> Option<Self> {
        const OPENAI_PREFIXES: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt-"];
        const BEDROCK_PREFIXES: &[&str] = &["amazon.", "anthropic.", "meta.", "mistral.", "cohere.", "ai21."];

        if OPENAI_PREFIXES.iter().any(|p| model.starts_with(p)) {
            Some(Vendor::OpenAi)
        } else if BEDROCK_PREFIXES.iter().any(|p| model.starts_with(p)) {
            Some(Vendor::Bedrock)
        } else {
            None
        }
    }

    /// Explicit vendor wins, otherwise the model identifier decides
    pub fn resolve(explicit: Option<Vendor>, model: &str) -> ChatpoolResult<Self> {
        explicit.or_else(|| Vendor::for_model(model)).ok_or_else(|| {
            ChatpoolError::config(format!(
                "cannot infer the vendor of model `{}`, set the vendor explicitly",
                model
            ))
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Bedrock => "bedrock",
        }
    }
}

impl std::str::FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Vendor::OpenAi),
            "bedrock" => Ok(Vendor::Bedrock),
            other => Err(format!("unknown vendor `{}` (expected openai or bedrock)", other)),
        }
    }
}

/// One conversation to complete
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// Build the request for a unit, applying its per-unit overrides
    pub fn for_unit(unit: &ConversationUnit, default_model: &str) -> Self {
        let prompt = unit.prompt();
        let UnitOptions {
            model,
            temperature,
            max_tokens,
        } = &prompt.options;

        Self {
            model: model.clone().unwrap_or_else(|| default_model.to_string()),
            messages: prompt.messages.clone(),
            temperature: *temperature,
            max_tokens: *max_tokens,
        }
    }
}

/// Failures a completion client may report
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request rejected: {0}")]
    Permanent(String),
}

impl CompletionError {
    /// Timeouts and rate limits may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompletionError::RateLimited(_) | CompletionError::Timeout(_))
    }
}

/// Send one conversation, receive one completion
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Perform one round trip. `timeout` is advisory for the transport; the
    /// task runner enforces it independently.
    async fn complete(&self, request: &CompletionRequest, timeout: Duration) -> Result<String, CompletionError>;
}
