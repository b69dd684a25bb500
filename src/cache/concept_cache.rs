//! Concept Expansion Cache: keyed by lowercased,
//! trimmed term, 30-day TTL.

use crate::domain::concept::ConceptExpansion;
use crate::error::Result;
use std::path::Path;

use super::store::JsonFileCache;

const TTL_DAYS: i64 = 30;

pub struct ConceptExpansionCache {
    inner: JsonFileCache<ConceptExpansion>,
}

impl ConceptExpansionCache {
    pub fn open(path: &Path, prompt_version: impl Into<String>) -> Result<Self> {
        Ok(Self {
            inner: JsonFileCache::open(path, Some(chrono::Duration::days(TTL_DAYS)), prompt_version.into())?,
        })
    }

    pub fn get(&self, term: &str) -> Option<ConceptExpansion> {
        self.inner.get(&ConceptExpansion::cache_key(term))
    }

    pub fn set(&self, term: &str, expansion: ConceptExpansion) {
        self.inner.set(ConceptExpansion::cache_key(term), expansion);
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
    use crate::domain::concept::ExpansionSource;
    use tempfile::tempdir;

    fn sample() -> ConceptExpansion {
        ConceptExpansion {
            original: "NSCLC".into(),
            primary_form: "non-small cell lung cancer".into(),
            synonyms: vec![],
            abbreviation_expansion: Some("non-small cell lung cancer".into()),
            omop_domain_hint: None,
            vocabulary_hints: vec![],
            confidence: 0.9,
            source: ExpansionSource::Llm,
            cached_at: chrono::Utc::now(),
            prompt_version: "v1".into(),
        }
    }

    #[test]
    fn keys_are_case_and_whitespace_insensitive() {
        let dir = tempdir().unwrap();
        let cache = ConceptExpansionCache::open(&dir.path().join("c.json"), "v1").unwrap();
        cache.set("  NSCLC  ", sample());
        assert!(cache.get("nsclc").is_some());
    }
}
