//! Provider error taxonomy with retryability

use std::time::Duration;

/// Normalized provider failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },

    #[error("invalid API key")]
    InvalidKey,

    #[error("provider error ({status}): {message}")]
    Provider {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("circuit open for {provider}/{model}")]
    CircuitOpen { provider: String, model: String },

    #[error("unknown provider failure: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Only rate limits, transient provider errors, and timeouts are retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } | Self::Timeout(_) => true,
            Self::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Map an HTTP status to the matching error kind
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 => Self::InvalidKey,
            402 => Self::QuotaExceeded(message),
            429 => Self::RateLimit { retry_after },
            408 | 500 | 502 | 503 | 504 => Self::Provider {
                status,
                message,
                retryable: true,
            },
            _ => Self::Provider {
                status,
                message,
                retryable: false,
            },
        }
    }
}
