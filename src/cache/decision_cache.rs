//! LLM Decision Cache: keyed by
//! `md5(normalizedInput ++ modelName)`, caching the raw decision produced
//! by a single `callLLM` round so identical prompts against the same
//! model never leave the process.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::store::JsonFileCache;

/// A cached LLM response: the text and the structured-mode flag it was
/// produced under, so a cache hit can be replayed without re-parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDecision {
    pub raw_response: String,
    pub json_mode: bool,
    pub provider: String,
    pub model: String,
}

pub struct LlmDecisionCache {
    inner: JsonFileCache<CachedDecision>,
}

impl LlmDecisionCache {
    pub fn open(path: &Path, prompt_version: impl Into<String>) -> Result<Self> {
        Ok(Self {
            inner: JsonFileCache::open(path, None, prompt_version.into())?,
        })
    }

    /// `md5(normalizedInput ⊕ modelName)`
    pub fn key(normalized_input: &str, model_name: &str) -> String {
        let digest = md5::compute(format!("{normalized_input}{model_name}"));
        format!("{digest:x}")
    }

    pub fn get(&self, normalized_input: &str, model_name: &str) -> Option<CachedDecision> {
        self.inner.get(&Self::key(normalized_input, model_name))
    }

    pub fn set(&self, normalized_input: &str, model_name: &str, decision: CachedDecision) {
        self.inner.set(Self::key(normalized_input, model_name), decision);
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_changes_with_model_name() {
        let a = LlmDecisionCache::key("some prompt", "claude-3");
        let b = LlmDecisionCache::key("some prompt", "gpt-4");
        assert_ne!(a, b);
    }

    #[test]
    fn round_trips_a_decision() {
        let dir = tempdir().unwrap();
        let cache = LlmDecisionCache::open(&dir.path().join("d.json"), "v1").unwrap();
        let decision = CachedDecision {
            raw_response: "{\"ok\":true}".into(),
            json_mode: true,
            provider: "anthropic".into(),
            model: "claude-3".into(),
        };
        cache.set("prompt", "claude-3", decision.clone());
        assert_eq!(cache.get("prompt", "claude-3"), Some(decision));
        assert_eq!(cache.get("prompt", "gpt-4"), None);
    }
}
