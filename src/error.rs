//! Error taxonomy for the interpretation pipeline.
//!
//! Every layer - gateway, reflection, stage, validator - returns the same
//! [`Result`]. Stage-local errors that are not [`Error::Fatal`] are caught at
//! the orchestrator boundary and downgraded to a warning rather than
//! propagated (see [`crate::orchestrator`]).

use crate::validation::ValidationError;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable category tags attached to recovered warnings.
pub mod category {
    pub const UNMAPPED: &str = "unmapped";
    pub const LLM_FAILED: &str = "llm_failed";
    pub const CACHE_VERSION_MISMATCH: &str = "cache_version_mismatch";
    pub const ATOMIC_COUNT_MISMATCH: &str = "atomic_count_mismatch";
    pub const REFERENTIAL_INTEGRITY: &str = "referential_integrity";
}

#[derive(Error, Debug)]
pub enum Error {
    /// HTTP 5xx/429, rate-limit, resource-exhausted, timeout, connection-reset.
    /// Handled internally by the LLM Gateway's backoff + failover; only
    /// surfaces once every provider tier is exhausted (see `LlmExhausted`).
    #[error("transport error calling {provider}: {message}")]
    Transport { provider: String, message: String },

    /// All configured provider tiers (primary/secondary/tertiary) exhausted
    /// their retry budget for a single call.
    #[error("LLM exhausted across all provider tiers for stage {stage}: {last_error}")]
    LlmExhausted { stage: String, last_error: String },

    /// Invalid JSON from an LLM, or output that fails schema validation even
    /// after the Reflection Engine's one correction pass.
    #[error("schema validation failed: {0}")]
    SchemaValidation(#[from] ValidationError),

    /// An LLM decision disagreed with a known pattern, or confidence fell
    /// below threshold, with no fallback value available.
    #[error("semantic validation failed (confidence {confidence:.2}): {reason}")]
    Semantic { confidence: f64, reason: String },

    /// A generated id references an entity that does not exist.
    #[error("referential integrity violation: {field} references missing id {referent}")]
    Referential { field: String, referent: String },

    /// Vocabulary database unreachable, or a query adapter cannot connect.
    #[error("data unavailable: {0}")]
    DataAvailability(String),

    /// A critical stage (2, 4, 7) failed outright; the orchestrator must
    /// abort downstream stages.
    #[error("fatal error in stage {stage}: {message}")]
    Fatal { stage: String, message: String },

    /// Cache load/persist I/O failure.
    #[error("cache I/O error: {0}")]
    CacheIo(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem I/O error outside the cache subsystem (artifact writes, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error: missing required credential, invalid value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cooperative cancellation was requested at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// Catch-all for conditions that do not fit the taxonomy above.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn llm_exhausted(stage: impl Into<String>, last_error: impl Into<String>) -> Self {
        Self::LlmExhausted {
            stage: stage.into(),
            last_error: last_error.into(),
        }
    }

    pub fn semantic(confidence: f64, reason: impl Into<String>) -> Self {
        Self::Semantic {
            confidence,
            reason: reason.into(),
        }
    }

    pub fn referential(field: impl Into<String>, referent: impl Into<String>) -> Self {
        Self::Referential {
            field: field.into(),
            referent: referent.into(),
        }
    }

    pub fn fatal(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether a raw error message is in the transport-class retry set
    /// described in
    pub fn is_retryable(message: &str) -> bool {
        const PATTERNS: &[&str] = &[
            "503",
            "504",
            "429",
            "rate limit",
            "resource exhausted",
            "overloaded",
            "timeout",
            "connection",
        ];
        let lower = message.to_lowercase();
        PATTERNS.iter().any(|p| lower.contains(p))
    }

    /// Whether this error should abort the whole run rather than being
    /// downgraded to a warning at the orchestrator boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_pattern_matching() {
        assert!(Error::is_retryable("HTTP 503 Service Unavailable"));
        assert!(Error::is_retryable("Rate limit exceeded"));
        assert!(Error::is_retryable("RESOURCE_EXHAUSTED"));
        assert!(Error::is_retryable("request timeout"));
        assert!(Error::is_retryable("connection reset by peer"));
        assert!(!Error::is_retryable("invalid api key"));
        assert!(!Error::is_retryable("malformed json"));
    }

    #[test]
    fn fatal_classification() {
        let fatal = Error::fatal("stage2_atomic_decomposition", "all providers exhausted");
        assert!(fatal.is_fatal());
        let non_fatal = Error::semantic(0.4, "below threshold");
        assert!(!non_fatal.is_fatal());
    }
}
