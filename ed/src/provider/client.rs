//! ChatClient trait - the raw per-provider call surface
//!
//! A `ChatClient` does one thing: turn a normalized request into a
//! normalized response for a single provider+model. Retry, circuit
//! breaking, rate limiting, caching, and deadlines are layered on top by
//! [`super::adapter::ProviderAdapter`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::ProviderError;
use super::types::{ChatMessage, ChatOptions, ChatResponse, StreamChunk};

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Issue one chat-completion call
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse, ProviderError>;

    /// Streaming variant: chunks are sent to the channel as they arrive and
    /// the final normalized response is returned
    ///
    /// The default implementation performs a complete call and emits its
    /// text as a single delta.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<ChatResponse, ProviderError> {
        let response = self.chat(messages, options).await?;
        let _ = chunk_tx.send(StreamChunk::TextDelta(response.text.clone())).await;
        let _ = chunk_tx
            .send(StreamChunk::Done {
                finish_reason: response.finish_reason,
            })
            .await;
        Ok(response)
    }

    /// Cheap probe used for wizard-time credential validation
    ///
    /// Default implementation issues a one-token call.
    async fn validate_model(&self) -> Result<(), ProviderError> {
        let probe = [ChatMessage::user("ping")];
        let options = ChatOptions::default().with_max_tokens(1);
        self.chat(&probe, &options).await.map(|_| ())
    }

    /// Provider tag this client talks to
    fn provider(&self) -> &str;

    /// Model identifier this client is bound to
    fn model(&self) -> &str;
}
