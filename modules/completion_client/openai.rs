use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::keys::KeyedClient;
use super::{CompletionClient, CompletionError, CompletionRequest, Vendor};
use crate::modules::error::{ChatpoolError, ChatpoolResult};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for OpenAI-compatible `/chat/completions` endpoints
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: Option<String>) -> ChatpoolResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ChatpoolError::config(format!("cannot build HTTP client: {}", e)))?;
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

impl KeyedClient for OpenAiClient {
    const KEY_ENV: &'static str = "OPENAI_API_KEY";

    fn with_api_key(api_key: String) -> ChatpoolResult<Self> {
        Self::new(api_key, None)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAi
    }

    async fn complete(&self, request: &CompletionRequest, timeout: Duration) -> Result<String, CompletionError> {
        let body = self.build_request_body(request);
        debug!(
            "Sending {} message(s) to model {} with {:?} timeout",
            request.messages.len(),
            request.model,
            timeout
        );

        let response = self
            .http
            .post(self.url())
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout(timeout)
                } else {
                    CompletionError::Permanent(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout(timeout)
            } else {
                CompletionError::Permanent(format!("failed to read response: {}", e))
            }
        })?;

        if !status.is_success() {
            return Err(classify_status(status, &response_text, timeout));
        }

        let output = extract_output(&response_text)?;
        info!("Model {} returned {} characters", request.model, output.len());
        Ok(output)
    }
}

/// Map an unsuccessful HTTP status onto the completion error taxonomy
fn classify_status(status: StatusCode, body: &str, timeout: Duration) -> CompletionError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}: {}", status, body.trim()));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CompletionError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CompletionError::Timeout(timeout),
        _ => CompletionError::Permanent(message),
    }
}

fn extract_output(response_text: &str) -> Result<String, CompletionError> {
    let v: Value = serde_json::from_str(response_text)
        .map_err(|e| CompletionError::Permanent(format!("failed to parse response JSON: {}", e)))?;

    if let Some(err) = v.get("error") {
        let msg = err["message"].as_str().unwrap_or("unknown error");
        return Err(CompletionError::Permanent(format!("API error: {}", msg)));
    }

    v["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| CompletionError::Permanent("response has no message content".to_string()))
}
