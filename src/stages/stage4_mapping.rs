//! Stage 4 — OMOP/FHIR Mapping: vocabulary search → LLM
//! semantic-match → domain-validation → semantic-name-validation →
//! unmapped-term recovery → Clinical Reasoner fallback. A critical stage:
//! outright failure aborts the pipeline, but an individual atomic that
//! exhausts every recovery path is simply emitted unmapped for Stage 12's
//! data-source classifier to pick up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::cache::query_cache::CachedConceptLookup;
use crate::cache::OmopQueryCache;
use crate::clinical_reasoner::ClinicalReasoner;
use crate::domain::atomic::Atomic;
use crate::domain::mapping::{FhirMapping, MappedAtomic, OmopMapping, SemanticVerdict};
use crate::error::{Error, Result};
use crate::gateway::LlmGateway;
use crate::reflection::{ReflectionEngine, SEMANTIC_CONFIDENCE_THRESHOLD};

/// Vocabulary text search against the bundled OMOP `concept` table.
/// Degrades to an empty candidate list (not an error) when no database
/// path is configured, letting the mapping pipeline fall through to its
/// LLM-driven recovery paths.
pub struct VocabularySearch {
    db_path: Option<PathBuf>,
    cache: Arc<OmopQueryCache>,
    pool: Arc<Semaphore>,
}

impl VocabularySearch {
    pub fn new(db_path: Option<PathBuf>, cache: Arc<OmopQueryCache>, pool_size: usize) -> Self {
        Self {
            db_path,
            cache,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    pub async fn search(&self, vocabulary: &str, domain: &str, term: &str) -> Vec<CachedConceptLookup> {
        if let Some(hit) = self.cache.get(vocabulary, domain, term) {
            return hit;
        }
        let Some(db_path) = self.db_path.clone() else {
            return Vec::new();
        };

        let _permit = self.pool.acquire().await.expect("vocabulary pool semaphore closed");
        let domain = domain.to_string();
        let pattern = format!("%{}%", term.trim());
        let results = tokio::task::spawn_blocking(move || -> Result<Vec<CachedConceptLookup>> {
            let conn = Connection::open(&db_path)
                .map_err(|e| Error::DataAvailability(format!("failed to open vocabulary database: {e}")))?;
            let mut stmt = conn
                .prepare(
                    "SELECT concept_id, concept_name, standard_concept FROM concept \
                     WHERE domain_id = ?1 AND concept_name LIKE ?2 LIMIT 10",
                )
                .map_err(|e| Error::DataAvailability(format!("vocabulary query prepare failed: {e}")))?;
            let rows = stmt
                .query_map(params![domain, pattern], |row| {
                    let standard: Option<String> = row.get(2)?;
                    Ok(CachedConceptLookup {
                        concept_id: row.get(0)?,
                        concept_name: row.get(1)?,
                        is_standard: standard.as_deref() == Some("S"),
                    })
                })
                .map_err(|e| Error::DataAvailability(format!("vocabulary query failed: {e}")))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::DataAvailability(format!("vocabulary row decode failed: {e}")))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()));

        match results {
            Ok(Ok(concepts)) => {
                self.cache.set(vocabulary, domain.as_str(), term, concepts.clone());
                concepts
            }
            Ok(Err(err)) | Err(err) => {
                warn!(error = %err, term = %term, "vocabulary search failed, returning no candidates");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SemanticMatchResponse {
    #[serde(rename = "selectedId")]
    selected_id: Option<i64>,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct DomainValidationResponse {
    valid: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SemanticNameValidationResponse {
    verdict: String,
    #[serde(default = "default_name_confidence")]
    confidence: f64,
}

fn default_name_confidence() -> f64 {
    0.5
}

pub struct Stage4Mapping {
    gateway: Arc<LlmGateway>,
    reflection: Arc<ReflectionEngine>,
    clinical_reasoner: Arc<ClinicalReasoner>,
    vocabulary: Arc<VocabularySearch>,
}

impl Stage4Mapping {
    pub fn new(
        gateway: Arc<LlmGateway>,
        reflection: Arc<ReflectionEngine>,
        clinical_reasoner: Arc<ClinicalReasoner>,
        vocabulary: Arc<VocabularySearch>,
    ) -> Self {
        Self {
            gateway,
            reflection,
            clinical_reasoner,
            vocabulary,
        }
    }

    #[instrument(skip(self, atomics, companion_mappings), fields(atomic_count = atomics.len()))]
    pub async fn run(
        &self,
        atomics: &[Atomic],
        criterion_text_of: impl Fn(&str) -> String,
        companion_mappings: &HashMap<String, Vec<OmopMapping>>,
    ) -> Result<Vec<MappedAtomic>> {
        let mut out = Vec::with_capacity(atomics.len());
        for atomic in atomics {
            let criterion_text = criterion_text_of(&atomic.criterion_id);
            out.push(self.map_one(atomic, &criterion_text, companion_mappings).await);
        }
        Ok(out)
    }

    /// Apply a criterion-level pre-extracted mapping from the optional
    /// `omop_mappings.json` companion input before running the
    /// vocabulary-search/LLM pipeline. Treated as already-reviewed, so no
    /// further semantic validation is applied.
    fn try_companion_mapping(&self, atomic: &Atomic, companion_mappings: &HashMap<String, Vec<OmopMapping>>) -> Option<MappedAtomic> {
        let candidates = companion_mappings.get(&atomic.criterion_id)?;
        let (primary, secondary) = candidates.split_first()?;
        Some(MappedAtomic {
            atomic: atomic.clone(),
            primary_omop: Some(primary.clone()),
            secondary_omop: secondary.to_vec(),
            fhir: fhir_mapping_for(&primary.domain_id, &primary.concept_name),
            validation_confidence: 1.0,
            semantic_verdict: SemanticVerdict::Valid,
        })
    }

    async fn map_one(&self, atomic: &Atomic, criterion_text: &str, companion_mappings: &HashMap<String, Vec<OmopMapping>>) -> MappedAtomic {
        if let Some(mapped) = self.try_companion_mapping(atomic, companion_mappings) {
            return mapped;
        }

        let domain = atomic.domain_hint.clone().unwrap_or_else(|| "Observation".to_string());

        if let Some(mapped) = self.try_map_against_term(atomic, &domain, &atomic.atomic_text, criterion_text).await {
            return mapped;
        }

        let alternatives = self
            .reflection
            .recover_unmapped_term(&atomic.atomic_text, criterion_text)
            .await
            .unwrap_or_default();
        for alt in &alternatives {
            if let Some(mapped) = self.try_map_against_term(atomic, &domain, alt, criterion_text).await {
                return mapped;
            }
        }

        if let Some(verdict) = self.clinical_reasoner.reason_term(&atomic.atomic_text).await {
            if let Some(concept) = verdict.best_concept() {
                if verdict.confidence >= SEMANTIC_CONFIDENCE_THRESHOLD {
                    if let Some(mapped) = self.try_map_against_term(atomic, &concept.domain, &concept.concept, criterion_text).await {
                        return mapped;
                    }
                }
            }
        }

        MappedAtomic::unmapped(atomic.clone())
    }

    /// One full vocabulary-search → semantic-match → domain-validation →
    /// name-validation pass against a specific candidate term.
    async fn try_map_against_term(&self, atomic: &Atomic, domain: &str, term: &str, criterion_text: &str) -> Option<MappedAtomic> {
        let candidates = self.vocabulary.search("SNOMED", domain, term).await;
        if candidates.is_empty() {
            return None;
        }

        let selected = self.semantic_match(atomic, term, &candidates).await?;
        if selected.confidence < SEMANTIC_CONFIDENCE_THRESHOLD {
            return None;
        }
        let chosen = candidates.iter().find(|c| Some(c.concept_id) == selected.selected_id)?;

        if !self.validate_domain(atomic, domain, &chosen.concept_name).await {
            return None;
        }

        let verdict = self.validate_semantic_name(atomic, criterion_text, &chosen.concept_name).await;
        if self.reflection.validate_semantic_mapping(selected.confidence, verdict.0).is_err() {
            return None;
        }

        let mapping = OmopMapping {
            concept_id: chosen.concept_id,
            concept_name: chosen.concept_name.clone(),
            vocabulary_id: "SNOMED".to_string(),
            domain_id: domain.to_string(),
            table_name: crate::domain::sql_atomic::OmopTable::from_domain(domain)
                .map(|t| t.table_name().to_string())
                .unwrap_or_default(),
            is_standard: chosen.is_standard,
        };

        let secondary: Vec<OmopMapping> = candidates
            .iter()
            .filter(|c| c.concept_id != chosen.concept_id)
            .take(9)
            .map(|c| OmopMapping {
                concept_id: c.concept_id,
                concept_name: c.concept_name.clone(),
                vocabulary_id: "SNOMED".to_string(),
                domain_id: domain.to_string(),
                table_name: crate::domain::sql_atomic::OmopTable::from_domain(domain)
                    .map(|t| t.table_name().to_string())
                    .unwrap_or_default(),
                is_standard: c.is_standard,
            })
            .collect();

        Some(MappedAtomic {
            atomic: atomic.clone(),
            primary_omop: Some(mapping),
            secondary_omop: secondary,
            fhir: fhir_mapping_for(domain, &chosen.concept_name),
            validation_confidence: verdict.1,
            semantic_verdict: verdict.0,
        })
    }

    async fn semantic_match(&self, atomic: &Atomic, term: &str, candidates: &[CachedConceptLookup]) -> Option<SemanticMatchResponse> {
        let candidates_json = serde_json::to_string(candidates).ok()?;
        let prompt = format!(
            "Clinical eligibility phrase: \"{}\" (normalized term: \"{term}\").\n\
             Candidate OMOP concepts: {candidates_json}\n\n\
             Select the single best-matching concept id, or null if none match. \
             Respond as JSON: {{\"selectedId\": integer|null, \"confidence\": number between 0 and 1}}.",
            atomic.atomic_text
        );
        let raw = self.gateway.call_llm("stage4_semantic_match", &prompt, true, 512, 0.0).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    async fn validate_domain(&self, atomic: &Atomic, domain: &str, concept_name: &str) -> bool {
        let prompt = format!(
            "Does the OMOP domain \"{domain}\" correctly classify the clinical eligibility phrase \
             \"{}\", given the matched concept \"{concept_name}\"? Respond JSON: \
             {{\"valid\": boolean, \"reason\": string}}.",
            atomic.atomic_text
        );
        match self.gateway.call_llm("stage4_domain_validation", &prompt, true, 256, 0.0).await {
            Ok(raw) => serde_json::from_str::<DomainValidationResponse>(&raw).map(|r| r.valid).unwrap_or(true),
            Err(err) => {
                warn!(error = %err, "domain validation call failed, defaulting to accept");
                true
            }
        }
    }

    /// Semantic-name-validation: catches substring false
    /// positives ("ANC" matching "cancer") by checking whether the
    /// matched concept's *name* actually means what the atomic says.
    async fn validate_semantic_name(&self, atomic: &Atomic, criterion_text: &str, concept_name: &str) -> (SemanticVerdict, f64) {
        let prompt = format!(
            "Criterion: \"{criterion_text}\"\nEligibility phrase: \"{}\"\nMatched OMOP concept name: \"{concept_name}\"\n\n\
             Does the concept name mean the same clinical thing as the phrase (not just share a substring)? \
             Respond JSON: {{\"verdict\": \"valid\"|\"not_valid\"|\"uncertain\", \"confidence\": number between 0 and 1}}.",
            atomic.atomic_text
        );
        match self.gateway.call_llm("stage4_semantic_name_validation", &prompt, true, 256, 0.0).await {
            Ok(raw) => match serde_json::from_str::<SemanticNameValidationResponse>(&raw) {
                Ok(resp) => {
                    let verdict = match resp.verdict.as_str() {
                        "valid" => SemanticVerdict::Valid,
                        "not_valid" => SemanticVerdict::NotValid,
                        _ => SemanticVerdict::Uncertain,
                    };
                    (verdict, resp.confidence.clamp(0.0, 1.0))
                }
                Err(_) => (SemanticVerdict::Uncertain, 0.5),
            },
            Err(err) => {
                warn!(error = %err, "semantic name validation call failed, treating as uncertain");
                (SemanticVerdict::Uncertain, 0.5)
            }
        }
    }
}

fn fhir_mapping_for(domain: &str, concept_name: &str) -> Vec<FhirMapping> {
    let resource_type = match domain.to_lowercase().as_str() {
        "condition" => "Condition",
        "drug" => "MedicationRequest",
        "measurement" | "observation" => "Observation",
        "procedure" => "Procedure",
        "device" => "DeviceRequest",
        _ => return Vec::new(),
    };
    vec![FhirMapping {
        resource_type: resource_type.to_string(),
        code_system: "http://snomed.info/sct".to_string(),
        code: concept_name.to_string(),
        search_parameter: Some(format!("{resource_type}?code=...")),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fhir_mapping_picks_resource_from_domain() {
        let mappings = fhir_mapping_for("Condition", "lung cancer");
        assert_eq!(mappings[0].resource_type, "Condition");
        assert!(fhir_mapping_for("unknown", "x").is_empty());
    }

    fn test_stage4() -> Stage4Mapping {
        let gateway = Arc::new(LlmGateway::new(
            &crate::config::PipelineConfig::for_tests(),
            Arc::new(crate::cache::LlmDecisionCache::open(&std::env::temp_dir().join("stage4_companion_test_decisions.json"), "test").unwrap()),
        ));
        let reflection = Arc::new(ReflectionEngine::new(gateway.clone()));
        let clinical_reasoner = Arc::new(ClinicalReasoner::new(gateway.clone()));
        let vocabulary = Arc::new(VocabularySearch::new(
            None,
            Arc::new(OmopQueryCache::open(&std::env::temp_dir().join("stage4_companion_test_vocab.json"), "test").unwrap()),
            1,
        ));
        Stage4Mapping::new(gateway, reflection, clinical_reasoner, vocabulary)
    }

    #[test]
    fn companion_mapping_is_preferred_over_search_pipeline() {
        let stage4 = test_stage4();
        let atomic = Atomic {
            atomic_id: "A1".to_string(),
            atomic_text: "ECOG 0-1".to_string(),
            criterion_id: "INC_1".to_string(),
            criterion_type: crate::domain::raw_criterion::CriterionType::Inclusion,
            logical_group: "INC_1.0".to_string(),
            domain_hint: Some("Observation".to_string()),
            clinical_category: None,
            clinical_concept_group: None,
        };
        let mut companion = HashMap::new();
        companion.insert(
            "INC_1".to_string(),
            vec![OmopMapping {
                concept_id: 4230427,
                concept_name: "ECOG performance status".to_string(),
                vocabulary_id: "SNOMED".to_string(),
                domain_id: "Observation".to_string(),
                table_name: "measurement".to_string(),
                is_standard: true,
            }],
        );

        let mapped = stage4.try_companion_mapping(&atomic, &companion).unwrap();
        assert_eq!(mapped.primary_omop.unwrap().concept_id, 4230427);
        assert_eq!(mapped.semantic_verdict, SemanticVerdict::Valid);
    }

    #[test]
    fn companion_mapping_absent_returns_none() {
        let stage4 = test_stage4();
        let atomic = Atomic {
            atomic_id: "A1".to_string(),
            atomic_text: "ECOG 0-1".to_string(),
            criterion_id: "INC_1".to_string(),
            criterion_type: crate::domain::raw_criterion::CriterionType::Inclusion,
            logical_group: "INC_1.0".to_string(),
            domain_hint: None,
            clinical_category: None,
            clinical_concept_group: None,
        };
        assert!(stage4.try_companion_mapping(&atomic, &HashMap::new()).is_none());
    }

    #[tokio::test]
    async fn vocabulary_search_without_db_path_returns_empty() {
        let cache = Arc::new(OmopQueryCache::open(&std::env::temp_dir().join("stage4_test_cache.json"), "test").unwrap());
        let search = VocabularySearch::new(None, cache, 10);
        let results = search.search("SNOMED", "Condition", "lung cancer").await;
        assert!(results.is_empty());
    }
}
