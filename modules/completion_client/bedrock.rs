use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, SdkError};
use aws_sdk_bedrockruntime::operation::invoke_model::InvokeModelError;
use aws_sdk_bedrockruntime::{primitives::Blob, Client as RuntimeClient};
use serde_json::{json, Value};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{CompletionClient, CompletionError, CompletionRequest, Vendor};
use crate::modules::conversation::{Message, Role};

const DEFAULT_MAX_TOKENS: u32 = 4000;
const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Client for models hosted on AWS Bedrock. Credentials come from the
/// standard AWS provider chain rather than an API key.
pub struct BedrockClient {
    runtime: Arc<RuntimeClient>,
}

impl BedrockClient {
    pub fn new(runtime: Arc<RuntimeClient>) -> Self {
        Self { runtime }
    }

    /// Load the AWS configuration from the environment, optionally pinning a region
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        Self::new(Arc::new(RuntimeClient::new(&config)))
    }
}

#[async_trait]
impl CompletionClient for BedrockClient {
    fn vendor(&self) -> Vendor {
        Vendor::Bedrock
    }

    async fn complete(&self, request: &CompletionRequest, timeout: Duration) -> Result<String, CompletionError> {
        let request_body = build_request_body(request);
        debug!(
            "Invoking Bedrock model {} with {} message(s)",
            request.model,
            request.messages.len()
        );

        let response = self
            .runtime
            .invoke_model()
            .model_id(&request.model)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(request_body.to_string().into_bytes()))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, timeout))?;

        let response_body: Value = serde_json::from_slice(response.body().as_ref())
            .map_err(|e| CompletionError::Permanent(format!("failed to parse Bedrock response: {}", e)))?;

        let output = extract_output(&request.model, &response_body)?;
        info!(
            "Bedrock model {} returned {} characters{}",
            request.model,
            output.len(),
            token_usage(&response_body)
                .map(|(input, output)| format!(" ({} input, {} output tokens)", input, output))
                .unwrap_or_default()
        );
        Ok(output)
    }
}

fn classify_sdk_error(err: SdkError<InvokeModelError>, timeout: Duration) -> CompletionError {
    if let SdkError::TimeoutError(_) = err {
        return CompletionError::Timeout(timeout);
    }

    let message = DisplayErrorContext(&err).to_string();
    match err.as_service_error() {
        Some(e) if e.is_throttling_exception() => CompletionError::RateLimited(message),
        Some(e) if e.is_access_denied_exception() => CompletionError::Auth(message),
        Some(e) if e.is_model_timeout_exception() => CompletionError::Timeout(timeout),
        _ => CompletionError::Permanent(message),
    }
}

/// Build request body based on model family
fn build_request_body(request: &CompletionRequest) -> Value {
    let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let system = system_text(&request.messages);
    let turns: Vec<&Message> = request.messages.iter().filter(|m| m.role != Role::System).collect();

    match request.model.as_str() {
        id if id.starts_with("amazon.nova") => {
            let mut body = json!({
                "messages": turns
                    .iter()
                    .map(|m| json!({ "role": m.role.as_str(), "content": [{ "text": m.content }] }))
                    .collect::<Vec<_>>(),
                "inferenceConfig": { "max_new_tokens": max_tokens },
            });
            if let Some(system) = system {
                body["system"] = json!([{ "text": system }]);
            }
            if let Some(temperature) = request.temperature {
                body["inferenceConfig"]["temperature"] = json!(temperature);
            }
            body
        }
        id if id.starts_with("anthropic.claude-v") || id.starts_with("anthropic.claude-instant") => {
            let mut body = json!({
                "prompt": format!("\n\n{}\n\nAssistant:", transcript(&request.messages, "Human")),
                "max_tokens_to_sample": max_tokens,
            });
            if let Some(temperature) = request.temperature {
                body["temperature"] = json!(temperature);
            }
            body
        }
        id if id.starts_with("anthropic.") => {
            let mut body = json!({
                "anthropic_version": ANTHROPIC_VERSION,
                "max_tokens": max_tokens,
                "messages": turns
                    .iter()
                    .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                    .collect::<Vec<_>>(),
            });
            if let Some(system) = system {
                body["system"] = json!(system);
            }
            if let Some(temperature) = request.temperature {
                body["temperature"] = json!(temperature);
            }
            body
        }
        id if id.starts_with("cohere.command-r") => {
            // Chat API: history plus the final user turn as `message`
            let (last, history) = turns.split_last().map_or((None, &[][..]), |(l, h)| (Some(*l), h));
            let mut body = json!({
                "message": last.map(|m| m.content.as_str()).unwrap_or_default(),
                "chat_history": history
                    .iter()
                    .map(|m| {
                        let role = if m.role == Role::Assistant { "CHATBOT" } else { "USER" };
                        json!({ "role": role, "message": m.content })
                    })
                    .collect::<Vec<_>>(),
                "max_tokens": max_tokens,
            });
            if let Some(system) = system {
                body["preamble"] = json!(system);
            }
            if let Some(temperature) = request.temperature {
                body["temperature"] = json!(temperature);
            }
            body
        }
        id if id.starts_with("ai21.jamba") => {
            let mut body = json!({
                "messages": request
                    .messages
                    .iter()
                    .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                    .collect::<Vec<_>>(),
                "max_tokens": max_tokens,
            });
            if let Some(temperature) = request.temperature {
                body["temperature"] = json!(temperature);
            }
            body
        }
        id if id.starts_with("ai21.") => {
            let mut body = json!({
                "prompt": format!("{}\n\nAssistant:", transcript(&request.messages, "User")),
                "maxTokens": max_tokens,
            });
            if let Some(temperature) = request.temperature {
                body["temperature"] = json!(temperature);
            }
            body
        }
        id if id.starts_with("amazon.titan") => {
            let mut config = json!({ "maxTokenCount": max_tokens });
            if let Some(temperature) = request.temperature {
                config["temperature"] = json!(temperature);
            }
            json!({
                "inputText": format!("{}\nBot:", transcript(&request.messages, "User")),
                "textGenerationConfig": config,
            })
        }
        id => {
            let length_key = if id.starts_with("meta.llama") { "max_gen_len" } else { "max_tokens" };
            let mut body = json!({
                "prompt": format!("{}\n\nAssistant:", transcript(&request.messages, "User")),
            });
            body[length_key] = json!(max_tokens);
            if let Some(temperature) = request.temperature {
                body["temperature"] = json!(temperature);
            }
            body
        }
    }
}

fn system_text(messages: &[Message]) -> Option<String> {
    let parts: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

/// Flatten a conversation for models that only take a raw prompt
fn transcript(messages: &[Message], user_label: &str) -> String {
    let mut out = String::new();
    for (i, m) in messages.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        let label = match m.role {
            Role::System => "System",
            Role::User => user_label,
            Role::Assistant => "Assistant",
        };
        let _ = write!(out, "{}: {}", label, m.content);
    }
    out
}

/// Extract output from response based on model family
fn extract_output(model_id: &str, response_body: &Value) -> Result<String, CompletionError> {
    let output = match model_id {
        id if id.starts_with("amazon.nova") => response_body["output"]["message"]["content"][0]["text"].as_str(),
        id if id.starts_with("anthropic.claude-v") || id.starts_with("anthropic.claude-instant") => {
            response_body["completion"].as_str()
        }
        id if id.starts_with("anthropic.") => response_body["content"][0]["text"].as_str(),
        id if id.starts_with("mistral.") => response_body["outputs"][0]["text"].as_str(),
        id if id.starts_with("meta.llama") => response_body["generation"].as_str(),
        id if id.starts_with("amazon.titan") => response_body["results"][0]["outputText"].as_str(),
        id if id.starts_with("cohere.command-r") => response_body["text"].as_str(),
        id if id.starts_with("cohere.") => response_body["generations"][0]["text"].as_str(),
        id if id.starts_with("ai21.jamba") => response_body["choices"][0]["message"]["content"].as_str(),
        id if id.starts_with("ai21.") => response_body["completions"][0]["data"]["text"].as_str(),
        _ => response_body["completion"]
            .as_str()
            .or_else(|| response_body["text"].as_str())
            .or_else(|| response_body["outputs"][0]["text"].as_str())
            .or_else(|| response_body["content"][0]["text"].as_str())
            .or_else(|| response_body["generation"].as_str()),
    };

    output
        .map(str::to_string)
        .ok_or_else(|| CompletionError::Permanent(format!("no content in response from {}", model_id)))
}

/// Input and output token counts, when the model reports them
fn token_usage(response_body: &Value) -> Option<(u64, u64)> {
    let usage = &response_body["usage"];
    let input = usage["inputTokens"].as_u64().or_else(|| usage["input_tokens"].as_u64());
    let output = usage["outputTokens"].as_u64().or_else(|| usage["output_tokens"].as_u64());
    input.zip(output).or_else(|| {
        let metrics = &response_body["amazon-bedrock-invocationMetrics"];
        metrics["inputTokenCount"].as_u64().zip(metrics["outputTokenCount"].as_u64())
    })
}
