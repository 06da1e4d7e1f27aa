//! Anthropic messages client

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::client::ChatClient;
use super::error::ProviderError;
use super::types::{ChatMessage, ChatOptions, ChatResponse, FinishReason, Role};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic API client bound to one model
///
/// The messages API has no seed or penalty parameters; those options are
/// silently ignored here, which the cache fingerprint still accounts for
/// because it hashes the requested options, not the provider wire format.
pub struct AnthropicClient {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
}

impl AnthropicClient {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, base_url: Option<String>) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .build()
            .map_err(|e| ProviderError::Unknown(format!("http client: {e}")))?;
        Ok(Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http,
        })
    }

    /// Anthropic takes the system prompt as a top-level field
    fn build_request_body(&self, messages: &[ChatMessage], options: &ChatOptions) -> serde_json::Value {
        debug!(model = %self.model, message_count = messages.len(), "build_request_body: called");
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let chat: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                serde_json::json!({
                    "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": chat,
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        if !system.is_empty() {
            body["system"] = serde_json::json!(system.join("\n\n"));
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if !options.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(options.stop);
        }

        body
    }

    fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolCalls,
            Some("refusal") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

#[async_trait]
impl ChatClient for AnthropicClient {
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(messages, options);
        let started = Instant::now();

        debug!(model = %self.model, "chat: issuing request");
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(Duration::from_secs(0))
                } else {
                    ProviderError::Provider {
                        status: 0,
                        message: e.to_string(),
                        retryable: true,
                    }
                }
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            debug!(status, "chat: API error");
            return Err(ProviderError::from_status(status, text, retry_after));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("malformed response body: {e}")))?;
        let parsed: AnthropicResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::Unknown(format!("unexpected response shape: {e}")))?;

        let text = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = Self::parse_finish_reason(parsed.stop_reason.as_deref());
        debug!(model = %self.model, finish_reason = %finish_reason, "chat: success");
        Ok(ChatResponse {
            text,
            prompt_tokens: parsed.usage.input_tokens,
            completion_tokens: parsed.usage.output_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
            finish_reason,
            cached: false,
            raw,
        })
    }

    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> AnthropicClient {
        AnthropicClient::new("claude-sonnet-4-5", "test-key", None).unwrap()
    }

    #[test]
    fn test_system_messages_are_hoisted() {
        let client = test_client();
        let messages = [
            ChatMessage::system("Be brief"),
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hi"),
            ChatMessage::user("Bye"),
        ];
        let body = client.build_request_body(&messages, &ChatOptions::default());

        assert_eq!(body["system"], "Be brief");
        let chat = body["messages"].as_array().unwrap();
        assert_eq!(chat.len(), 3);
        assert_eq!(chat[0]["role"], "user");
        assert_eq!(chat[1]["role"], "assistant");
    }

    #[test]
    fn test_max_tokens_defaulted() {
        let client = test_client();
        let body = client.build_request_body(&[ChatMessage::user("x")], &ChatOptions::default());
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);

        let body = client.build_request_body(
            &[ChatMessage::user("x")],
            &ChatOptions::default().with_max_tokens(99),
        );
        assert_eq!(body["max_tokens"], 99);
    }

    #[test]
    fn test_parse_finish_reason() {
        assert_eq!(
            AnthropicClient::parse_finish_reason(Some("end_turn")),
            FinishReason::Stop
        );
        assert_eq!(
            AnthropicClient::parse_finish_reason(Some("max_tokens")),
            FinishReason::Length
        );
        assert_eq!(
            AnthropicClient::parse_finish_reason(Some("tool_use")),
            FinishReason::ToolCalls
        );
    }
}
