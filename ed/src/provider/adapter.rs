//! ProviderAdapter - retry, breaker, bucket, cache, and deadline composition
//!
//! Call path for a cacheable request:
//! cache lookup (single-flight) -> token bucket -> retry loop
//! { breaker preflight -> deadline-wrapped provider call } -> cache fulfill.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::breaker::BreakerRegistry;
use super::bucket::BucketRegistry;
use super::cache::ResponseCache;
use super::client::ChatClient;
use super::error::ProviderError;
use super::pricing::PricingTable;
use super::retry::RetryPolicy;
use super::types::{ChatMessage, ChatOptions, ChatResponse};

/// Shared cross-adapter infrastructure
///
/// One instance per process: breakers, buckets, and the response cache are
/// global mutable state shared by every adapter and every worker.
pub struct ProviderInfra {
    pub breakers: BreakerRegistry,
    pub buckets: BucketRegistry,
    pub cache: ResponseCache,
    pub pricing: PricingTable,
    pub retry: RetryPolicy,
    /// Outer deadline applied to every provider call
    pub deadline: Duration,
}

/// Receives usage for calls whose cost is recorded asynchronously
/// (judges, the refiner, dataset generation). Execute workers skip the sink
/// and write their cost record in the same transaction as the output.
pub trait UsageSink: Send + Sync {
    fn record(&self, provider: &str, model: &str, prompt_tokens: u64, completion_tokens: u64, amount_usd: f64);
}

/// A ChatClient wrapped with the full resilience stack
#[derive(Clone)]
pub struct ProviderAdapter {
    client: Arc<dyn ChatClient>,
    infra: Arc<ProviderInfra>,
    usage_sink: Option<Arc<dyn UsageSink>>,
}

impl ProviderAdapter {
    pub fn new(client: Arc<dyn ChatClient>, infra: Arc<ProviderInfra>) -> Self {
        Self {
            client,
            infra,
            usage_sink: None,
        }
    }

    /// Attach an async usage sink; non-cached successes report through it
    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn provider(&self) -> &str {
        self.client.provider()
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Issue a chat call through the cache and resilience layers
    pub async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse, ProviderError> {
        let use_cache = ResponseCache::cacheable(options);
        let key = ResponseCache::fingerprint(self.provider(), self.model(), messages, options);

        if use_cache
            && let Some(hit) = self.infra.cache.get_or_claim(&key).await
        {
            return Ok(hit);
        }

        let result = self.call_with_policies(messages, options).await;
        if use_cache {
            match &result {
                Ok(response) => self.infra.cache.fulfill(&key, response),
                Err(_) => self.infra.cache.abandon(&key),
            }
        }
        if let (Ok(response), Some(sink)) = (&result, &self.usage_sink) {
            let cost = self.cost_of(response).unwrap_or_else(|e| {
                debug!(error = %e, "no pricing for usage sink, recording zero cost");
                0.0
            });
            sink.record(
                self.provider(),
                self.model(),
                response.prompt_tokens,
                response.completion_tokens,
                cost,
            );
        }
        result
    }

    async fn call_with_policies(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        let provider = self.provider();
        let model = self.model();

        self.infra.buckets.acquire(provider, model).await;

        let deadline = options.timeout.unwrap_or(self.infra.deadline);
        let client = &self.client;
        let breakers = &self.infra.breakers;

        self.infra
            .retry
            .run(|attempt| async move {
                breakers.preflight(provider, model)?;
                debug!(provider, model, attempt, "provider call");

                let outcome = tokio::time::timeout(deadline, client.chat(messages, options)).await;
                let result = match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::Timeout(deadline)),
                };

                match &result {
                    Ok(_) => breakers.record_success(provider, model),
                    Err(e) if trips_breaker(e) => breakers.record_failure(provider, model),
                    Err(_) => {}
                }
                result
            })
            .await
    }

    /// Streaming chat through the bucket and breaker
    ///
    /// Cache hits replay the stored text as one delta. Live streams make a
    /// single attempt: a retry mid-stream would replay partial output to
    /// the consumer.
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        chunk_tx: tokio::sync::mpsc::Sender<super::types::StreamChunk>,
    ) -> Result<ChatResponse, ProviderError> {
        use super::types::StreamChunk;

        let use_cache = ResponseCache::cacheable(options);
        let key = ResponseCache::fingerprint(self.provider(), self.model(), messages, options);

        if use_cache
            && let Some(hit) = self.infra.cache.get_or_claim(&key).await
        {
            let _ = chunk_tx.send(StreamChunk::TextDelta(hit.text.clone())).await;
            let _ = chunk_tx
                .send(StreamChunk::Done {
                    finish_reason: hit.finish_reason,
                })
                .await;
            return Ok(hit);
        }

        let provider = self.provider();
        let model = self.model();
        self.infra.buckets.acquire(provider, model).await;

        let result = match self.infra.breakers.preflight(provider, model) {
            Ok(()) => {
                let deadline = options.timeout.unwrap_or(self.infra.deadline);
                let outcome = tokio::time::timeout(deadline, self.client.stream_chat(messages, options, chunk_tx)).await;
                let result = match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::Timeout(deadline)),
                };
                match &result {
                    Ok(_) => self.infra.breakers.record_success(provider, model),
                    Err(e) if trips_breaker(e) => self.infra.breakers.record_failure(provider, model),
                    Err(_) => {}
                }
                result
            }
            Err(open) => Err(open),
        };

        if use_cache {
            match &result {
                Ok(response) => self.infra.cache.fulfill(&key, response),
                Err(_) => self.infra.cache.abandon(&key),
            }
        }
        result
    }

    /// Pure cost estimate from token counts
    pub fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> crate::error::Result<f64> {
        self.infra
            .pricing
            .estimate_cost(self.provider(), self.model(), prompt_tokens, completion_tokens)
    }

    /// Cost of an actual response; cache hits are free
    pub fn cost_of(&self, response: &ChatResponse) -> crate::error::Result<f64> {
        if response.cached {
            return Ok(0.0);
        }
        self.estimate_cost(response.prompt_tokens, response.completion_tokens)
    }

    /// Cheap credential probe
    pub async fn validate_model(&self) -> Result<(), ProviderError> {
        self.client.validate_model().await
    }
}

/// Rate limits back off via the bucket, not the breaker; auth and quota
/// failures are permanent and carry no availability signal.
fn trips_breaker(error: &ProviderError) -> bool {
    matches!(
        error,
        ProviderError::Provider { .. } | ProviderError::Timeout(_) | ProviderError::Unknown(_)
    )
}
