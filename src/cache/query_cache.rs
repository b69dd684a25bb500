//! OMOP Query Cache: keyed by the triple
//! `(vocabulary, domain, term)`, avoiding repeat concept-lookup round
//! trips against the same vocabulary source during a single mapping pass.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::store::JsonFileCache;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedConceptLookup {
    pub concept_id: i64,
    pub concept_name: String,
    pub is_standard: bool,
}

pub struct OmopQueryCache {
    inner: JsonFileCache<Vec<CachedConceptLookup>>,
}

impl OmopQueryCache {
    pub fn open(path: &Path, prompt_version: impl Into<String>) -> Result<Self> {
        Ok(Self {
            inner: JsonFileCache::open(path, None, prompt_version.into())?,
        })
    }

    fn key(vocabulary: &str, domain: &str, term: &str) -> String {
        format!("{}::{}::{}", vocabulary.to_lowercase(), domain.to_lowercase(), term.trim().to_lowercase())
    }

    pub fn get(&self, vocabulary: &str, domain: &str, term: &str) -> Option<Vec<CachedConceptLookup>> {
        self.inner.get(&Self::key(vocabulary, domain, term))
    }

    pub fn set(&self, vocabulary: &str, domain: &str, term: &str, results: Vec<CachedConceptLookup>) {
        self.inner.set(Self::key(vocabulary, domain, term), results);
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
    fn triple_key_is_order_sensitive_by_field() {
        let dir = tempdir().unwrap();
        let cache = OmopQueryCache::open(&dir.path().join("q.json"), "v1").unwrap();
        let hits = vec![CachedConceptLookup {
            concept_id: 1,
            concept_name: "lung cancer".into(),
            is_standard: true,
        }];
        cache.set("SNOMED", "Condition", "Lung Cancer", hits.clone());
        assert_eq!(cache.get("snomed", "condition", "lung cancer"), Some(hits));
        assert_eq!(cache.get("RxNorm", "Condition", "Lung Cancer"), None);
    }
}
