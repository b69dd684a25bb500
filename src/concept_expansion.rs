//! Concept Expansion & Term Normalization: for each unique
//! clinical term, try the cache, batch the misses into bounded-concurrency
//! LLM calls, and fall back to deterministic normalization when the LLM
//! itself is unavailable.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cache::ConceptExpansionCache;
use crate::domain::concept::{ConceptExpansion, ExpansionSource};
use crate::gateway::LlmGateway;

/// Deterministic domain keyword table used by the fallback cascade when
/// the LLM expansion path is unavailable or returns nothing usable.
const DOMAIN_KEYWORDS: &[(&str, &str)] = &[
    ("mutation", "Measurement"),
    ("positive", "Measurement"),
    ("negative", "Measurement"),
    ("level", "Measurement"),
    ("count", "Measurement"),
    ("ecog", "Observation"),
    ("performance status", "Observation"),
    ("history of", "Condition"),
    ("cancer", "Condition"),
    ("carcinoma", "Condition"),
    ("disease", "Condition"),
    ("syndrome", "Condition"),
    ("therapy", "Drug"),
    ("chemotherapy", "Drug"),
    ("treatment", "Drug"),
    ("surgery", "Procedure"),
    ("resection", "Procedure"),
    ("biopsy", "Procedure"),
];

pub struct ConceptExpansionService {
    gateway: Arc<LlmGateway>,
    cache: Arc<ConceptExpansionCache>,
    batch_size: usize,
    max_concurrent_batches: usize,
    prompt_version: String,
}

#[derive(Debug, Deserialize)]
struct LlmTermExpansion {
    term: String,
    #[serde(default)]
    abbreviation_expansion: Option<String>,
    #[serde(default)]
    synonyms: Vec<String>,
    #[serde(default)]
    omop_domain: Option<String>,
    #[serde(default)]
    vocabulary_hints: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl ConceptExpansionService {
    pub fn new(
        gateway: Arc<LlmGateway>,
        cache: Arc<ConceptExpansionCache>,
        batch_size: usize,
        max_concurrent_batches: usize,
        prompt_version: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            cache,
            batch_size,
            max_concurrent_batches,
            prompt_version: prompt_version.into(),
        }
    }

    /// Expand every distinct term in `terms`, preserving input order in the
    /// returned vector. Cache hits never touch the LLM; misses are batched
    /// into a single request and fall back to the keyword-table defaults on
    /// failure.
    #[instrument(skip(self, terms), fields(term_count = terms.len()))]
    pub async fn expand_terms(&self, terms: &[String]) -> Vec<ConceptExpansion> {
        let mut seen = std::collections::HashSet::new();
        let mut distinct = Vec::new();
        for term in terms {
            let key = ConceptExpansion::cache_key(term);
            if seen.insert(key) {
                distinct.push(term.clone());
            }
        }

        let mut resolved: HashMap<String, ConceptExpansion> = HashMap::new();
        let mut misses = Vec::new();
        for term in &distinct {
            if let Some(hit) = self.cache.get(term) {
                debug!(term = %term, "concept expansion cache hit");
                resolved.insert(ConceptExpansion::cache_key(term), hit);
            } else {
                misses.push(term.clone());
            }
        }

        if !misses.is_empty() {
            let batches: Vec<Vec<String>> = misses.chunks(self.batch_size).map(|c| c.to_vec()).collect();
            let results = stream::iter(batches)
                .map(|batch| self.expand_batch(batch))
                .buffer_unordered(self.max_concurrent_batches.max(1))
                .collect::<Vec<_>>()
                .await;

            for batch_result in results {
                for expansion in batch_result {
                    self.cache.set(&expansion.original, expansion.clone());
                    resolved.insert(ConceptExpansion::cache_key(&expansion.original), expansion);
                }
            }
        }

        terms
            .iter()
            .filter_map(|t| resolved.get(&ConceptExpansion::cache_key(t)).cloned())
            .collect()
    }

    async fn expand_batch(&self, batch: Vec<String>) -> Vec<ConceptExpansion> {
        let prompt = build_batch_prompt(&batch);
        match self
            .gateway
            .call_llm("concept_expansion", &prompt, true, 2048, 0.0)
            .await
        {
            Ok(raw) => self.parse_batch_response(&batch, &raw),
            Err(err) => {
                warn!(error = %err, batch_size = batch.len(), "concept expansion LLM call failed, using fallback");
                batch.iter().map(|term| deterministic_fallback(term, &self.prompt_version)).collect()
            }
        }
    }

    fn parse_batch_response(&self, batch: &[String], raw: &str) -> Vec<ConceptExpansion> {
        let parsed: Result<Vec<LlmTermExpansion>, _> = serde_json::from_str(raw).or_else(|_| {
            // Tolerate a top-level `{"expansions": [...]}` wrapper.
            let value: Value = serde_json::from_str(raw)?;
            serde_json::from_value(value.get("expansions").cloned().unwrap_or(Value::Array(vec![])))
        });

        let by_term: HashMap<String, LlmTermExpansion> = match parsed {
            Ok(items) => items.into_iter().map(|i| (ConceptExpansion::cache_key(&i.term), i)).collect(),
            Err(err) => {
                warn!(error = %err, "concept expansion response failed to parse, using fallback for whole batch");
                HashMap::new()
            }
        };

        batch
            .iter()
            .map(|term| {
                let key = ConceptExpansion::cache_key(term);
                match by_term.get(&key) {
                    Some(item) => ConceptExpansion {
                        original: term.clone(),
                        primary_form: item.abbreviation_expansion.clone().unwrap_or_else(|| term.clone()),
                        synonyms: item.synonyms.clone(),
                        abbreviation_expansion: item.abbreviation_expansion.clone(),
                        omop_domain_hint: item.omop_domain.clone(),
                        vocabulary_hints: item.vocabulary_hints.clone(),
                        confidence: item.confidence.clamp(0.0, 1.0),
                        source: ExpansionSource::Llm,
                        cached_at: chrono::Utc::now(),
                        prompt_version: self.prompt_version.clone(),
                    },
                    None => deterministic_fallback(term, &self.prompt_version),
                }
            })
            .collect()
    }
}

fn build_batch_prompt(batch: &[String]) -> String {
    let terms_list = batch.iter().map(|t| format!("- {t}")).collect::<Vec<_>>().join("\n");
    format!(
        "For each clinical term below, return a JSON array of objects with fields \
         `term`, `abbreviation_expansion` (nullable), `synonyms` (array), \
         `omop_domain` (one of Condition, Drug, Measurement, Procedure, Observation, Device, or null), \
         `vocabulary_hints` (array of OMOP vocabulary ids such as SNOMED, RxNorm, LOINC), \
         and `confidence` (0-1).\n\nTerms:\n{terms_list}"
    )
}

/// Deterministic fallback cascade: strip numeric constraints,
/// split compounds, extract clinical idioms, infer domain by keyword table.
pub fn deterministic_fallback(term: &str, prompt_version: &str) -> ConceptExpansion {
    let stripped = strip_numeric_constraints(term);
    let synonyms = split_compounds(&stripped);
    let idiom = extract_idiom(&stripped);
    let domain_hint = infer_domain(&stripped);

    ConceptExpansion {
        original: term.to_string(),
        primary_form: idiom.clone().unwrap_or_else(|| stripped.clone()),
        synonyms,
        abbreviation_expansion: None,
        omop_domain_hint: domain_hint,
        vocabulary_hints: Vec::new(),
        confidence: 0.3,
        source: ExpansionSource::Fallback,
        cached_at: chrono::Utc::now(),
        prompt_version: prompt_version.to_string(),
    }
}

/// Strip numeric constraints such as `>= 18`, `18 to 65`, and bare units,
/// leaving the clinical phrase behind.
fn strip_numeric_constraints(term: &str) -> String {
    let comparator_re = Regex::new(r"(?i)[≥≤><=]=?\s*\d+(\.\d+)?\s*[a-zA-Z/%]*").unwrap();
    let range_re = Regex::new(r"(?i)\b\d+(\.\d+)?\s*(to|-)\s*\d+(\.\d+)?\s*[a-zA-Z/%]*\b").unwrap();
    let stripped = comparator_re.replace_all(term, "");
    let stripped = range_re.replace_all(&stripped, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// Split a compound phrase on "and/or/with/without" connectors, returning
/// the individual clauses (excluding the original full phrase).
fn split_compounds(term: &str) -> Vec<String> {
    let re = Regex::new(r"(?i)\s+(and/or|and|or|with|without)\s+").unwrap();
    re.split(term)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s.to_lowercase() != term.to_lowercase())
        .collect()
}

/// Regex-extract common clinical idioms ("history of X", "X mutation", "X
/// positive"), returning the normalized core phrase if one matches.
fn extract_idiom(term: &str) -> Option<String> {
    let history_re = Regex::new(r"(?i)^history of\s+(.+)$").unwrap();
    if let Some(caps) = history_re.captures(term) {
        return Some(caps[1].trim().to_string());
    }
    let mutation_re = Regex::new(r"(?i)^(.+?)\s+mutation$").unwrap();
    if let Some(caps) = mutation_re.captures(term) {
        return Some(format!("{} mutation", caps[1].trim()));
    }
    let positive_re = Regex::new(r"(?i)^(.+?)\s+positive$").unwrap();
    if let Some(caps) = positive_re.captures(term) {
        return Some(format!("{} positive", caps[1].trim()));
    }
    None
}

fn infer_domain(term: &str) -> Option<String> {
    let lower = term.to_lowercase();
    DOMAIN_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, domain)| domain.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comparator_constraints() {
        assert_eq!(strip_numeric_constraints("Age >= 18 years"), "Age years");
        assert_eq!(strip_numeric_constraints("ANC ≥1500/mm3"), "ANC");
    }

    #[test]
    fn strips_range_constraints() {
        assert_eq!(strip_numeric_constraints("Age 18 to 65 years"), "Age years");
    }

    #[test]
    fn splits_on_connectors() {
        let parts = split_compounds("NSCLC or SCLC");
        assert_eq!(parts, vec!["NSCLC".to_string(), "SCLC".to_string()]);
    }

    #[test]
    fn extracts_history_of_idiom() {
        assert_eq!(extract_idiom("history of myocardial infarction"), Some("myocardial infarction".to_string()));
    }

    #[test]
    fn extracts_mutation_idiom() {
        assert_eq!(extract_idiom("EGFR mutation"), Some("EGFR mutation".to_string()));
    }

    #[test]
    fn infers_domain_from_keyword_table() {
        assert_eq!(infer_domain("EGFR mutation"), Some("Measurement".to_string()));
        assert_eq!(infer_domain("history of lung cancer"), Some("Condition".to_string()));
        assert_eq!(infer_domain("prior chemotherapy"), Some("Drug".to_string()));
    }

    #[test]
    fn fallback_produces_low_confidence_expansion() {
        let expansion = deterministic_fallback("EGFR mutation", "v1");
        assert_eq!(expansion.source, ExpansionSource::Fallback);
        assert_eq!(expansion.confidence, 0.3);
        assert_eq!(expansion.omop_domain_hint, Some("Measurement".to_string()));
    }
}
