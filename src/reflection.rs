//! The Reflection Engine: generate → validate → reflect →
//! correct for the pipeline's four validation domains. Every correction
//! path is bounded to exactly one re-prompt per validation per atomic, so
//! a stubborn model cannot blow up a stage's latency budget.

use tracing::{instrument, warn};

use crate::domain::mapping::SemanticVerdict;
use crate::domain::sql_atomic::{OmopTable, SqlAtomic};
use crate::error::Result;
use crate::gateway::LlmGateway;
use crate::validation::{ValidationError, ValidationResult};
use std::sync::Arc;

/// Confidence floor below which a semantic mapping verdict is rejected
/// regardless of what the model reports.
pub const SEMANTIC_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Result of running the SQL-for-table reflection pass.
#[derive(Debug, Clone)]
pub struct SqlReflectionOutcome {
    /// True if the correction pass replaced the SQL with a different,
    /// validator-accepted statement.
    pub corrected: bool,
    /// True if the SQL (original or corrected) passes schema validation.
    pub is_valid: bool,
    pub warnings: Vec<String>,
}

pub struct ReflectionEngine {
    gateway: Arc<LlmGateway>,
}

impl ReflectionEngine {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    /// Domain 1 — SQL-for-table: validate `atomic.sql` via
    /// [`SqlAtomic::validate_schema`]; on violation, re-prompt once with
    /// `{originalSql, violation, table, criterionText}` and accept the
    /// corrected SQL only if it is both different and itself valid.
    #[instrument(skip(self, atomic, criterion_text))]
    pub async fn reflect_sql_for_table(&self, atomic: &mut SqlAtomic, criterion_text: &str) -> SqlReflectionOutcome {
        if atomic.validate_schema().is_ok() {
            return SqlReflectionOutcome {
                corrected: false,
                is_valid: true,
                warnings: Vec::new(),
            };
        }

        let violation = atomic
            .validate_schema()
            .err()
            .map(|errors| errors.iter().map(|e| e.to_user_message()).collect::<Vec<_>>().join("; "))
            .unwrap_or_default();

        let original_sql = atomic.sql.clone();
        let prompt = format!(
            "The following OMOP CDM SQL template fails schema validation.\n\
             Original SQL: {original_sql}\n\
             Violation: {violation}\n\
             Target table: {table}\n\
             Criterion text: {criterion_text}\n\n\
             Return a corrected SELECT DISTINCT person_id statement against the \
             target table as a JSON object {{\"sql\": string}}.",
            table = atomic.table.table_name(),
        );

        let warnings = match self.gateway.call_llm("reflection_sql_for_table", &prompt, true, 1024, 0.0).await {
            Ok(raw) => match extract_sql_field(&raw) {
                Some(corrected_sql) if corrected_sql != original_sql => {
                    atomic.sql = corrected_sql;
                    if atomic.validate_schema().is_ok() {
                        return SqlReflectionOutcome {
                            corrected: true,
                            is_valid: true,
                            warnings: Vec::new(),
                        };
                    }
                    atomic.sql = original_sql;
                    vec![format!("reflection correction still invalid for table {}: {}", atomic.table.table_name(), violation)]
                }
                _ => vec![format!("reflection correction unchanged or unparsable: {}", violation)],
            },
            Err(err) => {
                warn!(error = %err, "SQL reflection LLM call failed");
                vec![format!("reflection call failed, original violation stands: {}", violation)]
            }
        };

        SqlReflectionOutcome {
            corrected: false,
            is_valid: false,
            warnings,
        }
    }

    /// Domain 2 — domain/table agreement: the atomic's
    /// declared domain hint must map to the same [`OmopTable`] it was
    /// actually assigned.
    pub fn validate_domain_table_agreement(domain_hint: Option<&str>, table: OmopTable) -> ValidationResult {
        match domain_hint.and_then(OmopTable::from_domain) {
            Some(expected) if expected == table => Ok(()),
            Some(expected) => Err(vec![ValidationError::constraint_violated(
                "domain",
                format!(
                    "domain hint resolves to table '{}' but atomic was assigned table '{}'",
                    expected.table_name(),
                    table.table_name()
                ),
            )]),
            None => Err(vec![ValidationError::constraint_violated(
                "domain",
                format!("domain hint missing or unrecognized; cannot confirm agreement with table '{}'", table.table_name()),
            )]),
        }
    }

    /// Domain 3 — semantic mapping validity: reject mappings
    /// under the confidence threshold or with a `not_valid` verdict,
    /// catching substring false positives such as "ANC" matching "cancer".
    pub fn validate_semantic_mapping(confidence: f64, verdict: SemanticVerdict) -> ValidationResult {
        if verdict == SemanticVerdict::NotValid {
            return Err(vec![ValidationError::constraint_violated(
                "semantic_verdict",
                "mapping judged not valid by semantic validation",
            )]);
        }
        if confidence < SEMANTIC_CONFIDENCE_THRESHOLD {
            return Err(vec![ValidationError::constraint_violated(
                "confidence",
                format!("confidence {confidence:.2} below threshold {SEMANTIC_CONFIDENCE_THRESHOLD:.2}"),
            )]);
        }
        Ok(())
    }

    /// Domain 4 — unmapped-term recovery: request up to 3
    /// alternative clinical phrasings for a term that failed mapping, so
    /// the caller can retry vocabulary search with each. Returns an empty
    /// list (not an error) if the LLM call itself fails; the caller's
    /// vocabulary search simply has nothing further to try.
    #[instrument(skip(self, atomic_text, criterion_text))]
    pub async fn recover_unmapped_term(&self, atomic_text: &str, criterion_text: &str) -> Result<Vec<String>> {
        let prompt = format!(
            "The clinical eligibility phrase \"{atomic_text}\" (from criterion: \"{criterion_text}\") \
             could not be mapped to a standard vocabulary concept. Suggest up to 3 alternative, \
             more standard clinical phrasings that preserve its meaning. Return JSON: \
             {{\"alternatives\": [string, ...]}}"
        );

        match self.gateway.call_llm("reflection_unmapped_recovery", &prompt, true, 512, 0.1).await {
            Ok(raw) => Ok(extract_alternatives(&raw)),
            Err(err) => {
                warn!(error = %err, term = %atomic_text, "unmapped-term recovery LLM call failed");
                Ok(Vec::new())
            }
        }
    }
}

fn extract_sql_field(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("sql")?.as_str().map(|s| s.trim().to_string())
}

fn extract_alternatives(raw: &str) -> Vec<String> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    value
        .get("alternatives")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.trim().to_string())).take(3).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::atomic::Atomic;
    use crate::domain::mapping::MappedAtomic;
    use crate::domain::raw_criterion::CriterionType;

    fn atomic(sql: &str, table: OmopTable) -> SqlAtomic {
        SqlAtomic {
            mapped: MappedAtomic::unmapped(Atomic {
                atomic_id: "A1".into(),
                atomic_text: "ANC >= 1500".into(),
                criterion_id: "INC_1".into(),
                criterion_type: CriterionType::Inclusion,
                logical_group: "INC_1.0".into(),
                domain_hint: Some("measurement".into()),
                clinical_category: None,
                clinical_concept_group: None,
            }),
            table,
            sql: sql.to_string(),
            fhir_search: None,
        }
    }

    #[test]
    fn domain_table_agreement_accepts_matching_domain() {
        let result = ReflectionEngine::validate_domain_table_agreement(Some("measurement"), OmopTable::Measurement);
        assert!(result.is_ok());
    }

    #[test]
    fn domain_table_agreement_rejects_mismatch() {
        let result = ReflectionEngine::validate_domain_table_agreement(Some("condition"), OmopTable::Measurement);
        assert!(result.is_err());
    }

    #[test]
    fn domain_table_agreement_rejects_missing_hint() {
        let result = ReflectionEngine::validate_domain_table_agreement(None, OmopTable::Measurement);
        assert!(result.is_err());
    }

    #[test]
    fn semantic_mapping_rejects_below_threshold() {
        let result = ReflectionEngine::validate_semantic_mapping(0.5, SemanticVerdict::Valid);
        assert!(result.is_err());
    }

    #[test]
    fn semantic_mapping_rejects_not_valid_regardless_of_confidence() {
        let result = ReflectionEngine::validate_semantic_mapping(0.95, SemanticVerdict::NotValid);
        assert!(result.is_err());
    }

    #[test]
    fn semantic_mapping_accepts_valid_above_threshold() {
        let result = ReflectionEngine::validate_semantic_mapping(0.9, SemanticVerdict::Valid);
        assert!(result.is_ok());
    }

    #[test]
    fn extract_sql_field_parses_wrapped_response() {
        let raw = r#"{"sql": "SELECT DISTINCT person_id FROM measurement WHERE measurement_concept_id = 1"}"#;
        assert_eq!(
            extract_sql_field(raw),
            Some("SELECT DISTINCT person_id FROM measurement WHERE measurement_concept_id = 1".to_string())
        );
    }

    #[test]
    fn extract_alternatives_caps_at_three() {
        let raw = r#"{"alternatives": ["a", "b", "c", "d"]}"#;
        assert_eq!(extract_alternatives(raw), vec!["a", "b", "c"]);
    }

    #[test]
    fn extract_alternatives_empty_on_malformed_json() {
        assert!(extract_alternatives("not json").is_empty());
    }

    #[tokio::test]
    async fn sql_reflection_is_a_noop_when_already_valid() {
        let gateway = Arc::new(LlmGateway::new(&crate::config::PipelineConfig::for_tests(), Arc::new(
            crate::cache::LlmDecisionCache::open(&std::env::temp_dir().join("reflection_test_cache.json"), "test").unwrap(),
        )));
        let engine = ReflectionEngine::new(gateway);
        let mut sql_atomic = atomic(
            "SELECT DISTINCT person_id FROM measurement WHERE measurement_concept_id = 1 AND value_as_number >= 1500",
            OmopTable::Measurement,
        );
        let outcome = engine.reflect_sql_for_table(&mut sql_atomic, "ANC >= 1500/mm3").await;
        assert!(outcome.is_valid);
        assert!(!outcome.corrected);
        assert!(outcome.warnings.is_empty());
    }
}
