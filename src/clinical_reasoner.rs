//! Clinical Reasoner: a narrowly-scoped LLM fallback invoked
//! by Stage 4 mapping and by Reflection's unmapped-term recovery once
//! vocabulary search and ordinary semantic matching both fail to reach a
//! confident decision. It reasons about an atomic in general clinical/
//! oncology terms rather than against a vocabulary table, and returns the
//! same `{selectedId?, confidence, rationale}` shape every other mapping
//! decision uses so callers need no special case. Grounded in the
//! original's `llm_clinical_reasoner.py`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::gateway::LlmGateway;

/// A single clinically-plausible concept suggested as an alternative
/// mapping target, with the domain it would live in if mapped.
#[derive(Debug, Clone, Deserialize)]
pub struct MappableConcept {
    pub concept: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub vocabulary_hints: Vec<String>,
}

fn default_domain() -> String {
    "Observation".to_string()
}

/// Verdict shape shared with Reflection's unmapped-term recovery and
/// Stage 4's semantic-match step: `selected_id` is `None` when the
/// reasoner can only suggest alternative concepts rather than commit to
/// one, in which case callers fall through to the next recovery step.
#[derive(Debug, Clone)]
pub struct ClinicalReasonerVerdict {
    pub original_term: String,
    pub clinical_interpretation: String,
    pub mappable_concepts: Vec<MappableConcept>,
    pub confidence: f64,
    pub rationale: String,
}

impl ClinicalReasonerVerdict {
    /// The single best alternative term to retry through vocabulary
    /// search, if the reasoner found one.
    pub fn best_concept(&self) -> Option<&MappableConcept> {
        self.mappable_concepts.first()
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    clinical_interpretation: String,
    #[serde(default)]
    mappable_concepts: Vec<MappableConcept>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

pub struct ClinicalReasoner {
    gateway: Arc<LlmGateway>,
}

impl ClinicalReasoner {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    /// Reason about a batch of unmapped terms in one LLM call. Terms the
    /// response omits, or that fail to parse, are simply absent from the
    /// returned map - callers treat a missing entry the same as a
    /// sub-threshold verdict.
    #[instrument(skip(self, terms), fields(term_count = terms.len()))]
    pub async fn reason_unmapped_terms(&self, terms: &[String]) -> HashMap<String, ClinicalReasonerVerdict> {
        if terms.is_empty() {
            return HashMap::new();
        }

        let prompt = build_prompt(terms);
        let raw = match self.gateway.call_llm("clinical_reasoner", &prompt, true, 4096, 0.1).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "clinical reasoner LLM call failed, no fallback available");
                return HashMap::new();
            }
        };

        parse_response(&raw, terms)
    }

    /// Reason about a single term; convenience wrapper over the batch path.
    pub async fn reason_term(&self, term: &str) -> Option<ClinicalReasonerVerdict> {
        self.reason_unmapped_terms(std::slice::from_ref(&term.to_string()))
            .await
            .remove(term)
    }
}

fn build_prompt(terms: &[String]) -> String {
    let terms_json = serde_json::to_string(terms).unwrap_or_default();
    format!(
        "You are a clinical terminology expert reasoning about eligibility criteria terms \
         that could not be mapped to a standard vocabulary concept. For each term, explain \
         its clinical intent in plain language and suggest up to three simpler, more \
         standard clinical concepts that might map successfully instead.\n\n\
         Respond as a JSON object keyed by the exact input term, where each value has the \
         shape {{\"clinical_interpretation\": string, \"mappable_concepts\": \
         [{{\"concept\": string, \"domain\": string, \"vocabulary_hints\": [string]}}], \
         \"confidence\": number between 0 and 1}}.\n\nTerms:\n{terms_json}"
    )
}

fn parse_response(raw: &str, terms: &[String]) -> HashMap<String, ClinicalReasonerVerdict> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "clinical reasoner response was not valid JSON");
            return HashMap::new();
        }
    };

    let object = match parsed.as_object() {
        Some(obj) => obj,
        None => {
            warn!("clinical reasoner response was not a JSON object");
            return HashMap::new();
        }
    };

    let by_lower: HashMap<String, &Value> = object.iter().map(|(k, v)| (k.to_lowercase(), v)).collect();

    let mut out = HashMap::new();
    for term in terms {
        let Some(value) = by_lower.get(&term.to_lowercase()) else {
            continue;
        };
        match serde_json::from_value::<RawVerdict>((*value).clone()) {
            Ok(raw_verdict) => {
                out.insert(
                    term.clone(),
                    ClinicalReasonerVerdict {
                        original_term: term.clone(),
                        clinical_interpretation: raw_verdict.clinical_interpretation,
                        mappable_concepts: raw_verdict.mappable_concepts,
                        confidence: raw_verdict.confidence.clamp(0.0, 1.0),
                        rationale: format!("clinical reasoner: {}", term),
                    },
                );
            }
            Err(err) => {
                warn!(term = %term, error = %err, "clinical reasoner verdict for term failed to parse");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_response() {
        let raw = r#"{
            "EGFR exon 19 deletion": {
                "clinical_interpretation": "A specific EGFR mutation subtype",
                "mappable_concepts": [
                    {"concept": "EGFR mutation", "domain": "Measurement", "vocabulary_hints": ["LOINC"]}
                ],
                "confidence": 0.82
            }
        }"#;
        let terms = vec!["EGFR exon 19 deletion".to_string()];
        let result = parse_response(raw, &terms);
        let verdict = result.get("EGFR exon 19 deletion").unwrap();
        assert_eq!(verdict.confidence, 0.82);
        assert_eq!(verdict.best_concept().unwrap().concept, "EGFR mutation");
    }

    #[test]
    fn case_insensitive_term_matching() {
        let raw = r#"{"egfr mutation": {"clinical_interpretation": "x", "mappable_concepts": [], "confidence": 0.4}}"#;
        let terms = vec!["EGFR Mutation".to_string()];
        let result = parse_response(raw, &terms);
        assert!(result.contains_key("EGFR Mutation"));
    }

    #[test]
    fn missing_term_in_response_is_simply_absent() {
        let raw = r#"{}"#;
        let terms = vec!["unknown term".to_string()];
        let result = parse_response(raw, &terms);
        assert!(result.is_empty());
    }

    #[test]
    fn malformed_json_yields_empty_map_not_panic() {
        let terms = vec!["term".to_string()];
        let result = parse_response("not json", &terms);
        assert!(result.is_empty());
    }

    #[test]
    fn confidence_is_clamped() {
        let raw = r#"{"t": {"clinical_interpretation": "x", "mappable_concepts": [], "confidence": 5.0}}"#;
        let terms = vec!["t".to_string()];
        let result = parse_response(raw, &terms);
        assert_eq!(result.get("t").unwrap().confidence, 1.0);
    }
}
