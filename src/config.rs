//! Ambient configuration surface.
//!
//! Centralizes every environment variable enumerated in the external
//! interfaces section: LLM credentials/models for all three provider tiers,
//! the vocabulary database path, prompt-version, caching, and concurrency
//! knobs. Mirrors the builder shape the LLM client itself uses for its own
//! `ClientConfig`.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Per-tier LLM provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub primary: ProviderConfig,
    pub secondary: Option<ProviderConfig>,
    pub tertiary: Option<ProviderConfig>,

    /// Advances to force cache invalidation (`PROMPT_VERSION`).
    pub prompt_version: String,

    /// Overrides provider selection for testing the fallback path
    /// (`USE_CLAUDE_PRIMARY`).
    pub use_claude_primary: bool,

    /// OMOP vocabulary database location (`ATHENA_DB_PATH`).
    pub athena_db_path: Option<PathBuf>,

    /// Root directory for the three on-disk caches.
    pub cache_dir: PathBuf,

    /// Root directory for per-stage artifacts and final outputs.
    pub artifact_dir: PathBuf,

    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    /// Sub-batch sizes defaults.
    pub batch_size_expansion: usize,
    pub batch_size_matching: usize,
    pub batch_size_classification: usize,

    /// Bounded concurrency for LLM sub-batches (default 3).
    pub max_concurrent_batches: usize,

    /// Vocabulary-query worker pool size (default 10).
    pub vocabulary_pool_size: usize,

    pub db_query_timeout: Duration,
}

impl PipelineConfig {
    /// Construct configuration from the documented environment variables.
    /// `PRIMARY_LLM_API_KEY` and `PRIMARY_LLM_MODEL` are required; every
    /// other field falls back to a documented default.
    pub fn from_env() -> Result<Self> {
        let primary = ProviderConfig {
            model: require_env("PRIMARY_LLM_MODEL")?,
            api_key: require_env("PRIMARY_LLM_API_KEY")?,
            base_url: optional_env("PRIMARY_LLM_BASE_URL"),
        };

        let secondary = match (optional_env("SECONDARY_LLM_MODEL"), optional_env("SECONDARY_LLM_API_KEY")) {
            (Some(model), Some(api_key)) => Some(ProviderConfig {
                model,
                api_key,
                base_url: optional_env("SECONDARY_LLM_BASE_URL"),
            }),
            _ => None,
        };

        let tertiary = match (optional_env("TERTIARY_LLM_MODEL"), optional_env("TERTIARY_LLM_API_KEY")) {
            (Some(model), Some(api_key)) => Some(ProviderConfig {
                model,
                api_key,
                base_url: optional_env("TERTIARY_LLM_BASE_URL"),
            }),
            _ => None,
        };

        Ok(Self {
            primary,
            secondary,
            tertiary,
            prompt_version: optional_env("PROMPT_VERSION").unwrap_or_else(|| "v1".to_string()),
            use_claude_primary: optional_env("USE_CLAUDE_PRIMARY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            athena_db_path: optional_env("ATHENA_DB_PATH").map(PathBuf::from),
            cache_dir: optional_env("PIPELINE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".cache")),
            artifact_dir: optional_env("PIPELINE_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("interpretation_stages")),
            timeout: Duration::from_secs(120),
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
            batch_size_expansion: 50,
            batch_size_matching: 20,
            batch_size_classification: 30,
            max_concurrent_batches: 3,
            vocabulary_pool_size: 10,
            db_query_timeout: Duration::from_secs(30),
        })
    }

    /// Build a config suitable for tests: no network credentials required.
    pub fn for_tests() -> Self {
        Self {
            primary: ProviderConfig {
                model: "test-primary".to_string(),
                api_key: "test-key".to_string(),
                base_url: None,
            },
            secondary: None,
            tertiary: None,
            prompt_version: "test".to_string(),
            use_claude_primary: false,
            athena_db_path: None,
            cache_dir: PathBuf::from(".cache"),
            artifact_dir: PathBuf::from("interpretation_stages"),
            timeout: Duration::from_secs(120),
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(10),
            batch_size_expansion: 50,
            batch_size_matching: 20,
            batch_size_classification: 30,
            max_concurrent_batches: 3,
            vocabulary_pool_size: 10,
            db_query_timeout: Duration::from_secs(30),
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::config(format!("missing required environment variable {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_has_no_network_requirements() {
        let config = PipelineConfig::for_tests();
        assert_eq!(config.primary.model, "test-primary");
        assert!(config.secondary.is_none());
        assert_eq!(config.max_concurrent_batches, 3);
        assert_eq!(config.vocabulary_pool_size, 10);
    }

    #[test]
    fn missing_required_env_is_config_error() {
        std::env::remove_var("PRIMARY_LLM_API_KEY");
        std::env::remove_var("PRIMARY_LLM_MODEL");
        let result = PipelineConfig::from_env();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
