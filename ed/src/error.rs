//! Crate-level error taxonomy
//!
//! Every adapter and service boundary maps its failures into one of these
//! kinds. Infrastructure failures unwind to the orchestrator, which
//! transitions the iteration state machine accordingly.

use std::time::Duration;

use crate::provider::ProviderError;

/// Edison error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum EdisonError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },

    #[error("transient provider failure: {0}")]
    ProviderTransient(String),

    #[error("permanent provider failure: {0}")]
    ProviderPermanent(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("budget exceeded: spend {spend_usd:.2} + estimate {estimate_usd:.2} > {budget_usd:.2} USD")]
    BudgetExceeded {
        spend_usd: f64,
        estimate_usd: f64,
        budget_usd: f64,
    },

    #[error("experiment lock held by {holder}")]
    LockHeld { holder: String },

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("invalid refinement diff: {0}")]
    DiffInvalid(String),

    #[error("internal error [{trace_id}]: {message}")]
    Internal { trace_id: String, message: String },
}

impl EdisonError {
    /// Wrap an unexpected failure with a fresh trace id
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            trace_id: uuid::Uuid::now_v7().to_string(),
            message: message.into(),
        }
    }

    /// Whether a retry of the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimit { .. } | Self::ProviderTransient(_)
        )
    }

    /// Stable kind tag for logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AuthFailure(_) => "auth_failure",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Timeout(_) => "timeout",
            Self::RateLimit { .. } => "rate_limit",
            Self::ProviderTransient(_) => "provider_transient",
            Self::ProviderPermanent(_) => "provider_permanent",
            Self::IntegrityViolation(_) => "integrity_violation",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::LockHeld { .. } => "lock_held",
            Self::ParseFailure(_) => "parse_failure",
            Self::DiffInvalid(_) => "diff_invalid",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<ProviderError> for EdisonError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimit { retry_after } => Self::RateLimit { retry_after },
            ProviderError::InvalidKey => Self::AuthFailure("invalid provider API key".to_string()),
            ProviderError::Timeout(d) => Self::Timeout(d),
            ProviderError::QuotaExceeded(msg) => Self::ProviderPermanent(format!("quota exceeded: {msg}")),
            ProviderError::CircuitOpen { provider, model } => {
                Self::ProviderTransient(format!("circuit open for {provider}/{model}"))
            }
            ProviderError::Provider {
                status,
                message,
                retryable,
            } => {
                if retryable {
                    Self::ProviderTransient(format!("provider error ({status}): {message}"))
                } else {
                    Self::ProviderPermanent(format!("provider error ({status}): {message}"))
                }
            }
            ProviderError::Unknown(msg) => Self::ProviderTransient(msg),
        }
    }
}

impl From<edisonstore::StoreError> for EdisonError {
    fn from(err: edisonstore::StoreError) -> Self {
        match err {
            edisonstore::StoreError::NotFound(what) => Self::NotFound(what),
            edisonstore::StoreError::Conflict(what) => Self::Conflict(what),
            edisonstore::StoreError::Integrity(what) => Self::IntegrityViolation(what),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EdisonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(EdisonError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(EdisonError::RateLimit { retry_after: None }.is_retryable());
        assert!(EdisonError::ProviderTransient("x".into()).is_retryable());
        assert!(!EdisonError::Validation("x".into()).is_retryable());
        assert!(!EdisonError::ProviderPermanent("x".into()).is_retryable());
        assert!(
            !EdisonError::BudgetExceeded {
                spend_usd: 1.0,
                estimate_usd: 0.5,
                budget_usd: 1.0
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_provider_error_mapping() {
        let err: EdisonError = ProviderError::Provider {
            status: 500,
            message: "boom".into(),
            retryable: true,
        }
        .into();
        assert_eq!(err.kind(), "provider_transient");

        let err: EdisonError = ProviderError::Provider {
            status: 400,
            message: "bad".into(),
            retryable: false,
        }
        .into();
        assert_eq!(err.kind(), "provider_permanent");

        let err: EdisonError = ProviderError::InvalidKey.into();
        assert_eq!(err.kind(), "auth_failure");
    }

    #[test]
    fn test_internal_carries_trace_id() {
        let err = EdisonError::internal("oops");
        if let EdisonError::Internal { trace_id, .. } = &err {
            assert!(!trace_id.is_empty());
        } else {
            panic!("expected Internal");
        }
    }
}
