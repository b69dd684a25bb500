//! `ConceptExpansion`: the normalized, LLM-or-fallback-expanded view of a
//! clinical term.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionSource {
    Cache,
    Llm,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptExpansion {
    pub original: String,
    pub primary_form: String,
    pub synonyms: Vec<String>,
    pub abbreviation_expansion: Option<String>,
    pub omop_domain_hint: Option<String>,
    pub vocabulary_hints: Vec<String>,
    pub confidence: f64,
    pub source: ExpansionSource,
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub prompt_version: String,
}

impl ConceptExpansion {
    /// Cache key = lowercased, whitespace-trimmed `original` (the prompt
    /// version is carried separately in the cache entry and checked at
    /// lookup time, ).
    pub fn cache_key(term: &str) -> String {
        term.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_normalizes_case_and_whitespace() {
        assert_eq!(ConceptExpansion::cache_key("  NSCLC  "), "nsclc");
        assert_eq!(ConceptExpansion::cache_key("Non-Small Cell"), "non-small cell");
    }
}
