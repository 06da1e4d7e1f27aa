//! Provider adapter layer
//!
//! Normalizes chat-completion calls across providers and wraps them with
//! retry, circuit-breaker, rate-limit, deadline, and response-cache
//! semantics. A registry keyed by provider tag selects the client variant at
//! instantiation time.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

mod adapter;
mod anthropic;
mod breaker;
mod bucket;
mod cache;
pub mod client;
mod error;
pub mod mock;
mod openai;
mod pricing;
mod retry;
mod types;

pub use adapter::{ProviderAdapter, ProviderInfra, UsageSink};
pub use anthropic::AnthropicClient;
pub use breaker::{BreakerConfig, BreakerRegistry};
pub use bucket::{BucketConfig, BucketRegistry};
pub use cache::{CacheConfig, ResponseCache};
pub use client::ChatClient;
pub use error::ProviderError;
pub use mock::MockClient;
pub use openai::OpenAiClient;
pub use pricing::{ModelPrice, PricingTable};
pub use retry::RetryPolicy;
pub use types::{ChatMessage, ChatOptions, ChatResponse, FinishReason, ResponseFormat, Role, StreamChunk};

use crate::error::{EdisonError, Result};

/// Opaque provider credential, passed in at registry construction
#[derive(Debug, Clone)]
pub struct Credential {
    pub api_key: String,
    pub base_url: Option<String>,
}

/// Registry of provider adapters keyed by provider tag
///
/// Shared infrastructure (breakers, buckets, cache, pricing) is owned here
/// and threaded into every adapter the registry hands out. Tests can install
/// pre-built clients for any (provider, model) pair.
pub struct ProviderRegistry {
    infra: Arc<ProviderInfra>,
    credentials: HashMap<String, Credential>,
    overrides: HashMap<(String, String), Arc<dyn ChatClient>>,
}

impl ProviderRegistry {
    pub fn new(infra: ProviderInfra, credentials: HashMap<String, Credential>) -> Self {
        Self {
            infra: Arc::new(infra),
            credentials,
            overrides: HashMap::new(),
        }
    }

    /// Install a pre-built client for a (provider, model) pair
    pub fn install(&mut self, client: Arc<dyn ChatClient>) {
        let key = (client.provider().to_string(), client.model().to_string());
        debug!(provider = %key.0, model = %key.1, "ProviderRegistry::install");
        self.overrides.insert(key, client);
    }

    /// Whether a credential exists for a provider (`mock` needs none)
    pub fn has_credential(&self, provider: &str) -> bool {
        provider == "mock" || self.credentials.contains_key(provider)
    }

    /// Shared pricing table
    pub fn pricing(&self) -> &PricingTable {
        &self.infra.pricing
    }

    /// Build (or fetch) an adapter for the given provider tag and model
    pub fn adapter(&self, provider: &str, model: &str) -> Result<ProviderAdapter> {
        if let Some(client) = self.overrides.get(&(provider.to_string(), model.to_string())) {
            return Ok(ProviderAdapter::new(client.clone(), self.infra.clone()));
        }

        let client: Arc<dyn ChatClient> = match provider {
            "openai" => {
                let cred = self.credential(provider)?;
                Arc::new(OpenAiClient::new(model, cred.api_key.clone(), cred.base_url.clone()).map_err(EdisonError::from)?)
            }
            "anthropic" => {
                let cred = self.credential(provider)?;
                Arc::new(
                    AnthropicClient::new(model, cred.api_key.clone(), cred.base_url.clone())
                        .map_err(EdisonError::from)?,
                )
            }
            "mock" => Arc::new(MockClient::fixed(model, "ok")),
            other => {
                return Err(EdisonError::Validation(format!(
                    "unknown provider: '{other}'. Supported: openai, anthropic, mock"
                )));
            }
        };

        Ok(ProviderAdapter::new(client, self.infra.clone()))
    }

    fn credential(&self, provider: &str) -> Result<&Credential> {
        self.credentials
            .get(provider)
            .ok_or_else(|| EdisonError::AuthFailure(format!("no credential configured for provider '{provider}'")))
    }
}
