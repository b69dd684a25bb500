//! The three on-disk caches described in: Concept Expansion,
//! LLM Decision, and OMOP Query. All three share the same mechanics
//! (single JSON file per cache, atomic rename-on-write, TTL + mandatory
//! `prompt_version` invalidation) via [`store::JsonFileCache`].

pub mod concept_cache;
pub mod decision_cache;
pub mod query_cache;
pub mod store;

pub use concept_cache::ConceptExpansionCache;
pub use decision_cache::LlmDecisionCache;
pub use query_cache::OmopQueryCache;

use std::sync::Arc;

/// Owns the three process-wide cache singletons, injected into the
/// orchestrator rather than accessed through module-level globals
/// ("module-level global state -> owned subsystems"). Held
/// behind `Arc` since every stage and the gateway need a shared handle
/// to the same on-disk file, serialized through the cache's own lock
/// ("cache access is single-threaded per process").
pub struct CacheRegistry {
    pub concept_expansion: Arc<ConceptExpansionCache>,
    pub llm_decision: Arc<LlmDecisionCache>,
    pub omop_query: Arc<OmopQueryCache>,
}

impl CacheRegistry {
    pub fn open(cache_dir: &std::path::Path, prompt_version: impl Into<String>) -> crate::error::Result<Self> {
        let prompt_version = prompt_version.into();
        Ok(Self {
            concept_expansion: Arc::new(ConceptExpansionCache::open(
                &cache_dir.join("concept_expansion_cache.json"),
                prompt_version.clone(),
            )?),
            llm_decision: Arc::new(LlmDecisionCache::open(
                &cache_dir.join("llm_decision_cache.json"),
                prompt_version.clone(),
            )?),
            omop_query: Arc::new(OmopQueryCache::open(&cache_dir.join("omop_query_cache.json"), prompt_version)?),
        })
    }

    /// Fresh, empty, in-memory-only registry for tests.
    pub fn fresh_for_tests(dir: &std::path::Path) -> crate::error::Result<Self> {
        Self::open(dir, "test")
    }

    /// Flush every cache's dirty entries to disk (explicit checkpoint, or
    /// process-exit flush ).
    pub fn checkpoint(&self) -> crate::error::Result<()> {
        self.concept_expansion.flush()?;
        self.llm_decision.flush()?;
        self.omop_query.flush()?;
        Ok(())
    }
}
