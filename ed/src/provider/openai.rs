//! OpenAI chat-completions client
//!
//! Implements the ChatClient trait against the Chat Completions API. Errors
//! are mapped into the normalized taxonomy; retry and breaker logic live in
//! the adapter layer, not here.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::client::ChatClient;
use super::error::ProviderError;
use super::types::{ChatMessage, ChatOptions, ChatResponse, FinishReason, ResponseFormat};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI API client bound to one model
pub struct OpenAiClient {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenAiClient {
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

    fn build_request_body(&self, messages: &[ChatMessage], options: &ChatOptions) -> serde_json::Value {
        debug!(model = %self.model, message_count = messages.len(), "build_request_body: called");
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });

        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(frequency_penalty) = options.frequency_penalty {
            body["frequency_penalty"] = serde_json::json!(frequency_penalty);
        }
        if let Some(presence_penalty) = options.presence_penalty {
            body["presence_penalty"] = serde_json::json!(presence_penalty);
        }
        if let Some(seed) = options.seed {
            body["seed"] = serde_json::json!(seed);
        }
        if !options.stop.is_empty() {
            body["stop"] = serde_json::json!(options.stop);
        }
        if options.response_format == ResponseFormat::JsonObject {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        body
    }

    fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("tool_calls") => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_request_body(messages, options);
        let started = Instant::now();

        debug!(model = %self.model, "chat: issuing request");
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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
        let parsed: OpenAiResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::Unknown(format!("unexpected response shape: {e}")))?;

        let choice = parsed.choices.into_iter().next();
        let (text, finish_reason) = match choice {
            Some(c) => (
                c.message.content.unwrap_or_default(),
                Self::parse_finish_reason(c.finish_reason.as_deref()),
            ),
            None => (String::new(), FinishReason::Stop),
        };

        debug!(model = %self.model, finish_reason = %finish_reason, "chat: success");
        Ok(ChatResponse {
            text,
            prompt_tokens: parsed.usage.prompt_tokens,
            completion_tokens: parsed.usage.completion_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
            finish_reason,
            cached: false,
            raw,
        })
    }

    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
