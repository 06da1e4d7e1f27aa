//! Mock provider for tests and local smoke runs
//!
//! Registered under the provider tag `mock`. Replies come from a scripted
//! queue; when the queue runs dry the fixed fallback reply (if any) is
//! served. Token counts are derived from whitespace word counts so cost
//! accounting paths stay exercised.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::client::ChatClient;
use super::error::ProviderError;
use super::types::{ChatMessage, ChatOptions, ChatResponse, FinishReason};

/// One scripted reply
pub type MockReply = Result<String, ProviderError>;

/// Scriptable mock chat client
pub struct MockClient {
    model: String,
    script: Mutex<VecDeque<MockReply>>,
    fallback: Option<String>,
    calls: AtomicUsize,
}

impl MockClient {
    /// Serve scripted replies in order, then fail when exhausted
    pub fn scripted(model: impl Into<String>, replies: Vec<MockReply>) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(replies.into_iter().collect()),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always serve the same reply
    pub fn fixed(model: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Some(reply.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Serve scripted replies, falling back to a fixed reply when exhausted
    pub fn scripted_with_fallback(
        model: impl Into<String>,
        replies: Vec<MockReply>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(replies.into_iter().collect()),
            fallback: Some(fallback.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of chat calls that reached this client (cache misses only)
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn word_count(text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

#[async_trait]
impl ChatClient for MockClient {
    async fn chat(&self, messages: &[ChatMessage], _options: &ChatOptions) -> Result<ChatResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        debug!(model = %self.model, call, scripted = next.is_some(), "MockClient::chat");

        let text = match next {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Err(err),
            None => match &self.fallback {
                Some(text) => text.clone(),
                None => return Err(ProviderError::Unknown("mock script exhausted".to_string())),
            },
        };

        let prompt_tokens: u64 = messages.iter().map(|m| Self::word_count(&m.content)).sum();
        Ok(ChatResponse {
            completion_tokens: Self::word_count(&text),
            prompt_tokens,
            latency_ms: 1,
            finish_reason: FinishReason::Stop,
            cached: false,
            raw: serde_json::json!({"mock": true}),
            text,
        })
    }

    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let client = MockClient::scripted("m1", vec![Ok("one".into()), Ok("two".into())]);
        let messages = [ChatMessage::user("hi")];

        let first = client.chat(&messages, &ChatOptions::default()).await.unwrap();
        assert_eq!(first.text, "one");
        let second = client.chat(&messages, &ChatOptions::default()).await.unwrap();
        assert_eq!(second.text, "two");

        let exhausted = client.chat(&messages, &ChatOptions::default()).await;
        assert!(exhausted.is_err());
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fixed_reply_never_exhausts() {
        let client = MockClient::fixed("m1", "same");
        for _ in 0..5 {
            let response = client
                .chat(&[ChatMessage::user("hi there")], &ChatOptions::default())
                .await
                .unwrap();
            assert_eq!(response.text, "same");
            assert_eq!(response.prompt_tokens, 2);
            assert_eq!(response.completion_tokens, 1);
        }
    }

    #[tokio::test]
    async fn test_scripted_error_propagates() {
        let client = MockClient::scripted(
            "m1",
            vec![Err(ProviderError::Provider {
                status: 500,
                message: "boom".into(),
                retryable: true,
            })],
        );
        let result = client.chat(&[ChatMessage::user("x")], &ChatOptions::default()).await;
        assert!(matches!(result, Err(ProviderError::Provider { status: 500, .. })));
    }
}
