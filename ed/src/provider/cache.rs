//! Content-addressed response cache
//!
//! Responses are keyed by a sha256 fingerprint of
//! `provider ∥ model ∥ messages ∥ params ∥ seed`. Within the TTL the
//! fingerprint guarantees at most one actual provider call per identical
//! request: the first caller claims an in-flight slot, later callers wait on
//! it and read the fulfilled entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::debug;

use super::types::{ChatMessage, ChatOptions, ChatResponse};

/// Interval at which waiters re-check an in-flight slot
const WAIT_RECHECK: Duration = Duration::from_millis(50);

/// Cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

enum Slot {
    Ready { response: ChatResponse, inserted: Instant },
    InFlight(Arc<Notify>),
}

/// Shared response cache
pub struct ResponseCache {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the request fingerprint
    pub fn fingerprint(provider: &str, model: &str, messages: &[ChatMessage], options: &ChatOptions) -> String {
        let canonical = serde_json::json!({
            "provider": provider,
            "model": model,
            "messages": messages
                .iter()
                .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "params": {
                "temperature": options.temperature,
                "max_tokens": options.max_tokens,
                "top_p": options.top_p,
                "frequency_penalty": options.frequency_penalty,
                "presence_penalty": options.presence_penalty,
                "stop": options.stop,
                "response_format": options.response_format,
            },
            "seed": options.seed,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Whether this request may touch the cache
    ///
    /// The only bypass is a nondeterministic request (no seed, temperature
    /// above zero) whose caller opted out; deterministic requests are always
    /// cached so the at-most-once guarantee holds.
    pub fn cacheable(options: &ChatOptions) -> bool {
        let nondeterministic = options.seed.is_none() && options.temperature.unwrap_or(0.0) > 0.0;
        !(options.no_cache && nondeterministic)
    }

    /// Look up a fingerprint, waiting out any in-flight call
    ///
    /// Returns `Some(response)` (with `cached = true`) on a hit. On a miss
    /// the caller has claimed the in-flight slot and must call
    /// [`Self::fulfill`] or [`Self::abandon`].
    pub async fn get_or_claim(&self, key: &str) -> Option<ChatResponse> {
        loop {
            let waiter = {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                match slots.get(key) {
                    Some(Slot::Ready { response, inserted }) if inserted.elapsed() < self.ttl => {
                        debug!(key, "cache hit");
                        let mut hit = response.clone();
                        hit.cached = true;
                        return Some(hit);
                    }
                    Some(Slot::InFlight(notify)) => notify.clone(),
                    _ => {
                        // Vacant or stale: claim the slot
                        debug!(key, "cache miss, claiming in-flight slot");
                        slots.insert(key.to_string(), Slot::InFlight(Arc::new(Notify::new())));
                        return None;
                    }
                }
            };
            // Bounded wait, then re-check; covers wake-ups lost between the
            // lock release and the notified() registration
            let _ = tokio::time::timeout(WAIT_RECHECK, waiter.notified()).await;
        }
    }

    /// Store a response for a previously claimed fingerprint
    pub fn fulfill(&self, key: &str, response: &ChatResponse) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut stored = response.clone();
        stored.cached = false;
        let previous = slots.insert(
            key.to_string(),
            Slot::Ready {
                response: stored,
                inserted: Instant::now(),
            },
        );
        if let Some(Slot::InFlight(notify)) = previous {
            notify.notify_waiters();
        }
    }

    /// Release a claimed fingerprint without storing (call failed)
    pub fn abandon(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(Slot::InFlight(notify)) = slots.remove(key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::FinishReason;
    use std::sync::Arc;

    fn response(text: &str) -> ChatResponse {
        ChatResponse {
            text: text.to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            latency_ms: 3,
            finish_reason: FinishReason::Stop,
            cached: false,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let messages = [ChatMessage::user("hello")];
        let options = ChatOptions::default().with_seed(7);
        let a = ResponseCache::fingerprint("openai", "gpt-4o", &messages, &options);
        let b = ResponseCache::fingerprint("openai", "gpt-4o", &messages, &options);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_varies_by_inputs() {
        let messages = [ChatMessage::user("hello")];
        let options = ChatOptions::default();
        let base = ResponseCache::fingerprint("openai", "gpt-4o", &messages, &options);

        assert_ne!(
            base,
            ResponseCache::fingerprint("anthropic", "gpt-4o", &messages, &options)
        );
        assert_ne!(
            base,
            ResponseCache::fingerprint("openai", "gpt-4o-mini", &messages, &options)
        );
        assert_ne!(
            base,
            ResponseCache::fingerprint("openai", "gpt-4o", &[ChatMessage::user("bye")], &options)
        );
        assert_ne!(
            base,
            ResponseCache::fingerprint("openai", "gpt-4o", &messages, &options.clone().with_seed(1))
        );
    }

    #[test]
    fn test_cacheable_rule() {
        // Deterministic requests always cacheable
        assert!(ResponseCache::cacheable(&ChatOptions::default()));
        assert!(ResponseCache::cacheable(&ChatOptions::default().with_seed(1)));

        // Opt-out alone is not enough when the request is deterministic
        let mut opted_out = ChatOptions::default();
        opted_out.no_cache = true;
        assert!(ResponseCache::cacheable(&opted_out));

        // Opt-out plus nondeterminism bypasses
        let mut hot = ChatOptions::default().with_temperature(0.9);
        hot.no_cache = true;
        assert!(!ResponseCache::cacheable(&hot));

        // Nondeterministic but seeded stays cacheable
        let mut seeded = ChatOptions::default().with_temperature(0.9).with_seed(42);
        seeded.no_cache = true;
        assert!(ResponseCache::cacheable(&seeded));
    }

    #[tokio::test]
    async fn test_hit_after_fulfill() {
        let cache = ResponseCache::new(CacheConfig::default());
        assert!(cache.get_or_claim("k1").await.is_none());
        cache.fulfill("k1", &response("hello"));

        let hit = cache.get_or_claim("k1").await.unwrap();
        assert!(hit.cached);
        assert_eq!(hit.text, "hello");
        assert_eq!(hit.prompt_tokens, 10);
    }

    #[tokio::test]
    async fn test_ttl_expiry_reclaims() {
        let cache = ResponseCache::new(CacheConfig { ttl_secs: 0 });
        assert!(cache.get_or_claim("k1").await.is_none());
        cache.fulfill("k1", &response("hello"));

        // TTL of zero: entry is immediately stale, so this is a fresh claim
        assert!(cache.get_or_claim("k1").await.is_none());
        cache.abandon("k1");
    }

    #[tokio::test]
    async fn test_single_flight_waiters_get_fulfilled_value() {
        let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
        assert!(cache.get_or_claim("k1").await.is_none());

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_claim("k1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.fulfill("k1", &response("winner"));

        let hit = waiter.await.unwrap().unwrap();
        assert!(hit.cached);
        assert_eq!(hit.text, "winner");
    }

    #[tokio::test]
    async fn test_abandon_lets_waiter_claim() {
        let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
        assert!(cache.get_or_claim("k1").await.is_none());

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_claim("k1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.abandon("k1");

        // The waiter claims the slot itself after the abandonment
        assert!(waiter.await.unwrap().is_none());
    }
}
