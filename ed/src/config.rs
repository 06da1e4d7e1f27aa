//! Configuration types and loading
//!
//! One YAML file configures the whole daemon: provider credentials (by env
//! var indirection, never inline secrets), resilience tuning, worker
//! concurrency, SSE heartbeat, refiner bounds, and the safety pattern
//! library. Every knob has a default matching the documented behavior, so
//! an absent file is a working configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EdisonError, Result};
use crate::events::SseConfig;
use crate::orchestrator::LockConfig;
use crate::provider::{
    BreakerConfig, BreakerRegistry, BucketConfig, BucketRegistry, CacheConfig, Credential, PricingTable,
    ProviderInfra, ProviderRegistry, ResponseCache, RetryPolicy,
};
use crate::refiner::RefinerConfig;
use crate::safety::PatternLibrary;
use crate::scheduler::SchedulerConfig;

/// Default outer deadline on provider calls
pub const DEFAULT_CALL_DEADLINE_SECS: u64 = 60;

/// Credential source for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredentialConfig {
    /// Environment variable holding the API key
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdisonConfig {
    pub store_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub providers: HashMap<String, ProviderCredentialConfig>,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub bucket: BucketConfig,
    pub scheduler: SchedulerConfig,
    pub sse: SseConfig,
    pub lock: LockConfig,
    pub refiner: Option<RefinerConfig>,
    pub safety_patterns: PatternLibrary,
    /// Outer deadline for every provider call
    pub call_deadline_secs: u64,
    /// Optional iteration-wide deadline
    pub iteration_deadline_secs: Option<u64>,
}

impl Default for EdisonConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderCredentialConfig {
                api_key_env: "OPENAI_API_KEY".to_string(),
                base_url: None,
            },
        );
        providers.insert(
            "anthropic".to_string(),
            ProviderCredentialConfig {
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                base_url: None,
            },
        );
        Self {
            store_path: None,
            log_level: None,
            providers,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            bucket: BucketConfig::default(),
            scheduler: SchedulerConfig::default(),
            sse: SseConfig::default(),
            lock: LockConfig::default(),
            refiner: None,
            safety_patterns: PatternLibrary::default(),
            call_deadline_secs: DEFAULT_CALL_DEADLINE_SECS,
            iteration_deadline_secs: None,
        }
    }
}

impl EdisonConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("edison")
            .join("config.yaml")
    }

    /// Load from an explicit path, or the default location; a missing file
    /// yields the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| EdisonError::Validation(format!("cannot read config {}: {e}", path.display())))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| EdisonError::Validation(format!("invalid config {}: {e}", path.display())))?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Peek at the configured log level before full initialization
    pub fn load_log_level(path: Option<&Path>) -> Option<String> {
        Self::load(path).ok().and_then(|config| config.log_level)
    }

    /// Where the record store lives
    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("edison")
                .join("records.db")
        })
    }

    /// Resolve credentials from the environment; providers whose env var is
    /// unset are simply absent (the pre-gate reports them if selected)
    pub fn credentials(&self) -> HashMap<String, Credential> {
        let mut credentials = HashMap::new();
        for (provider, source) in &self.providers {
            match std::env::var(&source.api_key_env) {
                Ok(api_key) if !api_key.is_empty() => {
                    credentials.insert(
                        provider.clone(),
                        Credential {
                            api_key,
                            base_url: source.base_url.clone(),
                        },
                    );
                }
                _ => {
                    warn!(provider, env = %source.api_key_env, "credential env var unset, provider unavailable");
                }
            }
        }
        credentials
    }

    /// Build the provider registry with shared infrastructure
    pub fn build_registry(&self) -> ProviderRegistry {
        let infra = ProviderInfra {
            breakers: BreakerRegistry::new(self.breaker.clone()),
            buckets: BucketRegistry::new(self.bucket.clone()),
            cache: ResponseCache::new(self.cache.clone()),
            pricing: PricingTable::builtin(),
            retry: self.retry.clone(),
            deadline: std::time::Duration::from_secs(self.call_deadline_secs),
        };
        ProviderRegistry::new(infra, self.credentials())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EdisonConfig::default();
        assert_eq!(config.call_deadline_secs, 60);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.sse.heartbeat_secs, 15);
        assert!(config.refiner.is_none());
        assert!(config.providers.contains_key("openai"));
    }

    #[test]
    fn test_load_missing_file_is_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config = EdisonConfig::load(Some(&temp.path().join("nope.yaml"))).unwrap();
        assert_eq!(config.call_deadline_secs, DEFAULT_CALL_DEADLINE_SECS);
    }

    #[test]
    fn test_load_partial_yaml() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "log_level: debug\ncall_deadline_secs: 30\nscheduler:\n  execute_concurrency: 8\n  judge_concurrency: 2\n  safety_concurrency: 1\n  generate_concurrency: 1\n",
        )
        .unwrap();

        let config = EdisonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.call_deadline_secs, 30);
        assert_eq!(config.scheduler.execute_concurrency, 8);
        // Untouched sections keep their defaults
        assert_eq!(config.cache.ttl_secs, 3600);
    }

    #[test]
    #[serial_test::serial]
    fn test_credentials_resolved_from_env() {
        let mut config = EdisonConfig::default();
        config.providers.insert(
            "openai".to_string(),
            ProviderCredentialConfig {
                api_key_env: "EDISON_TEST_OPENAI_KEY".to_string(),
                base_url: None,
            },
        );
        config.providers.remove("anthropic");

        // SAFETY: guarded by #[serial]; no other thread reads the
        // environment during this test
        unsafe { std::env::set_var("EDISON_TEST_OPENAI_KEY", "sk-test-123") };
        let credentials = config.credentials();
        assert_eq!(credentials["openai"].api_key, "sk-test-123");

        unsafe { std::env::remove_var("EDISON_TEST_OPENAI_KEY") };
        let credentials = config.credentials();
        assert!(!credentials.contains_key("openai"));
    }

    #[test]
    fn test_invalid_yaml_is_validation_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "call_deadline_secs: [not a number]").unwrap();
        assert!(matches!(
            EdisonConfig::load(Some(&path)),
            Err(EdisonError::Validation(_))
        ));
    }
}
