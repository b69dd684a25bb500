//! Stage 11 — Feasibility & Funnel Construction: classify
//! every criterion into a funnel category and queryable status, select at
//! most 15 "key criteria" by a composite score, then delegate the actual
//! sequential-retention funnel and population-estimate math to the
//! [`crate::population_estimator::PopulationEstimator`] this stage already
//! owns a handle to. Non-critical: a classification miss degrades a single
//! criterion to a conservative manual-review default rather than aborting
//! the run.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::domain::funnel::{FunnelResult, PopulationEstimate, PopulationEstimateMethod};
use crate::domain::key_criterion::{KeyCriterion, KeyCriterionCategory, QueryableStatus};
use crate::domain::mapping::MappedAtomic;
use crate::domain::raw_criterion::RawCriterion;
use crate::error::Result;
use crate::gateway::LlmGateway;
use crate::population_estimator::PopulationEstimator;
use crate::reference_data::ReferenceDataManager;

/// Elimination-rate floor (percent) above which a functional / treatment-
/// history / safety-exclusion criterion is auto-included regardless of
/// composite score.
const CATEGORY_AUTO_INCLUDE_THRESHOLD: f64 = 15.0;

/// Hard cap on the number of selected key criteria.
const MAX_KEY_CRITERIA: usize = 15;

/// Killer criteria surfaced in the execution guide.
const KILLER_CRITERION_COUNT: usize = 8;

/// Composite scores within this many percentage points are considered a
/// tie for the purposes of the reference-data tie-break.
const TIE_EPSILON: f64 = 0.5;

#[derive(Debug, Clone)]
struct Classification {
    category: KeyCriterionCategory,
    queryable_status: QueryableStatus,
    elimination_rate: f64,
    requires_manual_assessment: bool,
    biomarker_subtype: Option<String>,
}

fn fallback_classification() -> Classification {
    Classification {
        category: KeyCriterionCategory::Administrative,
        queryable_status: QueryableStatus::NonQueryable,
        elimination_rate: 5.0,
        requires_manual_assessment: true,
        biomarker_subtype: None,
    }
}

pub struct Stage11Feasibility {
    gateway: Arc<LlmGateway>,
    population_estimator: Arc<PopulationEstimator>,
    reference_data: Arc<ReferenceDataManager>,
}

impl Stage11Feasibility {
    pub fn new(
        gateway: Arc<LlmGateway>,
        population_estimator: Arc<PopulationEstimator>,
        reference_data: Arc<ReferenceDataManager>,
    ) -> Self {
        Self {
            gateway,
            population_estimator,
            reference_data,
        }
    }

    /// `base_population` is the catchment population the SyntheticAdapter
    /// or a live adapter resolves to; `mapped` supplies each
    /// criterion's OMOP mappings for the `data_availability` weight.
    #[instrument(skip(self, criteria, mapped), fields(criterion_count = criteria.len()))]
    pub async fn run(
        &self,
        criteria: &[RawCriterion],
        mapped: &[MappedAtomic],
        base_population: u64,
    ) -> Result<(FunnelResult, Vec<String>)> {
        let mappings_by_criterion = group_mappings_by_criterion(mapped);
        let classifications = self.classify_all(criteria).await;

        let mut candidates: Vec<KeyCriterion> = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            let classification = classifications
                .get(&criterion.criterion_id)
                .cloned()
                .unwrap_or_else(fallback_classification);
            let omop_mappings = mappings_by_criterion.get(&criterion.criterion_id).cloned().unwrap_or_default();
            candidates.push(KeyCriterion {
                key_id: criterion.criterion_id.clone(),
                original_criterion_ids: vec![criterion.criterion_id.clone()],
                category: classification.category,
                queryable_status: classification.queryable_status,
                estimated_elimination_rate: classification.elimination_rate,
                requires_manual_assessment: classification.requires_manual_assessment,
                is_killer_criterion: false,
                funnel_priority: 0,
                omop_mappings,
            });
        }

        let subtypes: HashMap<String, Option<String>> = classifications
            .iter()
            .map(|(id, c)| (id.clone(), c.biomarker_subtype.clone()))
            .collect();

        let mut selected = self.select_key_criteria(candidates, &subtypes);
        selected.sort_by(|a, b| a.key_id.cmp(&b.key_id));
        for (i, criterion) in selected.iter_mut().enumerate() {
            criterion.funnel_priority = i as u32;
        }

        let mut warnings = Vec::new();
        if selected.is_empty() {
            warnings.push("stage11: no key criteria survived selection, funnel will be empty".to_string());
        }

        let stages = self.population_estimator.build_funnel(&selected, base_population);
        let optimization_opportunities = self.population_estimator.optimization_opportunities(&stages);

        let final_population = stages.last().map(|s| s.patients_exiting).unwrap_or(base_population);
        let method = if stages.iter().any(|s| s.key_criteria.iter().any(|k| k.category == KeyCriterionCategory::Biomarker)) {
            PopulationEstimateMethod::Hybrid
        } else {
            PopulationEstimateMethod::Query
        };
        let population_estimate = PopulationEstimate::new(final_population, method);

        let mut queryable_selected: Vec<&KeyCriterion> = selected.iter().filter(|k| k.is_queryable()).collect();
        queryable_selected.sort_by(|a, b| {
            b.estimated_elimination_rate
                .partial_cmp(&a.estimated_elimination_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let killer_ids: Vec<String> = queryable_selected
            .into_iter()
            .take(KILLER_CRITERION_COUNT)
            .map(|k| k.key_id.clone())
            .collect();

        let mut stages = stages;
        for stage in &mut stages {
            for criterion in &mut stage.key_criteria {
                criterion.is_killer_criterion = killer_ids.contains(&criterion.key_id);
            }
        }

        let result = FunnelResult {
            stages,
            killer_criterion_ids: killer_ids,
            optimization_opportunities,
            site_rankings: Vec::new(),
            population_estimate,
        };

        if !result.is_monotonic() {
            warnings.push("stage11: funnel failed monotonicity check, clamping was insufficient".to_string());
        }

        Ok((result, warnings))
    }

    /// Composite-score selection: always keep the primary
    /// anchor and queryable biomarkers, auto-include high-elimination
    /// functional/treatment-history/safety-exclusion criteria, then fill
    /// remaining slots by descending composite score among the rest.
    fn select_key_criteria(
        &self,
        candidates: Vec<KeyCriterion>,
        subtypes: &HashMap<String, Option<String>>,
    ) -> Vec<KeyCriterion> {
        let mut selected_ids: Vec<String> = Vec::new();
        let mut remaining: Vec<KeyCriterion> = Vec::new();

        for candidate in candidates {
            let auto_include = match candidate.category {
                KeyCriterionCategory::PrimaryAnchor => true,
                KeyCriterionCategory::Biomarker => candidate.is_queryable(),
                KeyCriterionCategory::Functional
                | KeyCriterionCategory::TreatmentHistory
                | KeyCriterionCategory::SafetyExclusion => {
                    candidate.estimated_elimination_rate >= CATEGORY_AUTO_INCLUDE_THRESHOLD
                }
                KeyCriterionCategory::Administrative => false,
            };
            if auto_include && selected_ids.len() < MAX_KEY_CRITERIA {
                selected_ids.push(candidate.key_id.clone());
                remaining.push(candidate);
            } else {
                remaining.push(candidate);
            }
        }

        let mut selected: Vec<KeyCriterion> = remaining.iter().filter(|k| selected_ids.contains(&k.key_id)).cloned().collect();

        if selected.len() < MAX_KEY_CRITERIA {
            let mut scored: Vec<(f64, KeyCriterion)> = remaining
                .into_iter()
                .filter(|k| !selected_ids.contains(&k.key_id) && k.is_queryable())
                .map(|k| (self.composite_score(&k), k))
                .collect();

            scored.sort_by(|(score_a, a), (score_b, b)| {
                if (score_a - score_b).abs() <= TIE_EPSILON && a.category == b.category {
                    let tie = self.break_tie(a, b, subtypes);
                    if tie != std::cmp::Ordering::Equal {
                        return tie;
                    }
                }
                score_b.partial_cmp(score_a).unwrap_or(std::cmp::Ordering::Equal)
            });

            let slots_left = MAX_KEY_CRITERIA - selected.len();
            selected.extend(scored.into_iter().take(slots_left).map(|(_, k)| k));
        }

        selected
    }

    fn composite_score(&self, criterion: &KeyCriterion) -> f64 {
        let queryability_weight = match criterion.queryable_status {
            QueryableStatus::FullyQueryable => 1.0,
            QueryableStatus::PartiallyQueryable => 0.8,
            QueryableStatus::ReferenceBased => 0.5,
            QueryableStatus::NonQueryable => 0.2,
        };
        let data_availability = criterion.data_availability_weight().max(0.3);
        let category_bonus = match criterion.category {
            KeyCriterionCategory::PrimaryAnchor => 50.0,
            KeyCriterionCategory::Biomarker => 30.0,
            KeyCriterionCategory::TreatmentHistory => 15.0,
            KeyCriterionCategory::Functional => 10.0,
            KeyCriterionCategory::SafetyExclusion => 10.0,
            KeyCriterionCategory::Administrative => 0.0,
        };
        criterion.estimated_elimination_rate * queryability_weight * data_availability + category_bonus
    }

    /// Deterministic tie-break: consult biomarker frequency
    /// or screen-fail-rate reference data for the two candidates' category,
    /// preferring the one with the rarer/more-eliminating reference value;
    /// falls back to stable input order (equal) when reference data does
    /// not distinguish them either.
    fn break_tie(&self, a: &KeyCriterion, b: &KeyCriterion, subtypes: &HashMap<String, Option<String>>) -> std::cmp::Ordering {
        match a.category {
            KeyCriterionCategory::Biomarker => {
                let freq_a = self.reference_data.get_biomarker_frequency("NSCLC", &a.key_id, 1.0);
                let freq_b = self.reference_data.get_biomarker_frequency("NSCLC", &b.key_id, 1.0);
                freq_a.partial_cmp(&freq_b).unwrap_or(std::cmp::Ordering::Equal)
            }
            KeyCriterionCategory::Functional | KeyCriterionCategory::SafetyExclusion | KeyCriterionCategory::TreatmentHistory => {
                let category_key = category_reference_key(a.category);
                let subtype_a = subtypes.get(&a.key_id).cloned().flatten();
                let subtype_b = subtypes.get(&b.key_id).cloned().flatten();
                let rate_a = self.reference_data.get_screen_fail_rate(category_key, subtype_a.as_deref(), 0.0);
                let rate_b = self.reference_data.get_screen_fail_rate(category_key, subtype_b.as_deref(), 0.0);
                rate_b.partial_cmp(&rate_a).unwrap_or(std::cmp::Ordering::Equal)
            }
            _ => std::cmp::Ordering::Equal,
        }
    }

    async fn classify_all(&self, criteria: &[RawCriterion]) -> HashMap<String, Classification> {
        if criteria.is_empty() {
            return HashMap::new();
        }

        let prompt = build_classification_prompt(criteria);
        let raw = match self.gateway.call_llm("stage11_feasibility_classification", &prompt, true, 4096, 0.0).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "stage11 classification LLM call failed, every criterion falls back to manual review");
                return HashMap::new();
            }
        };

        parse_classification_response(&raw)
    }
}

fn category_reference_key(category: KeyCriterionCategory) -> &'static str {
    match category {
        KeyCriterionCategory::Functional => "functional",
        KeyCriterionCategory::SafetyExclusion => "safety_exclusion",
        KeyCriterionCategory::TreatmentHistory => "treatment_history",
        _ => "",
    }
}

fn group_mappings_by_criterion(mapped: &[MappedAtomic]) -> HashMap<String, Vec<crate::domain::mapping::OmopMapping>> {
    let mut out: HashMap<String, Vec<crate::domain::mapping::OmopMapping>> = HashMap::new();
    for m in mapped {
        if let Some(primary) = &m.primary_omop {
            out.entry(m.atomic.criterion_id.clone()).or_default().push(primary.clone());
        }
    }
    out
}

fn build_classification_prompt(criteria: &[RawCriterion]) -> String {
    let entries: Vec<Value> = criteria
        .iter()
        .map(|c| {
            serde_json::json!({
                "criterion_id": c.criterion_id,
                "criterion_type": c.criterion_type,
                "text": c.text,
            })
        })
        .collect();
    let criteria_json = serde_json::to_string(&entries).unwrap_or_default();
    format!(
        "Classify each clinical trial eligibility criterion below for feasibility funnel \
         construction. For each, decide:\n\
         - category: one of primary_anchor, biomarker, treatment_history, functional, \
         safety_exclusion, administrative\n\
         - queryable_status: one of fully_queryable, partially_queryable, reference_based, \
         non_queryable\n\
         - elimination_rate_percent: estimated percent of patients this criterion eliminates \
         (0-100)\n\
         - requires_manual_assessment: boolean, true if a human must review eligibility for \
         this criterion\n\
         - biomarker_subtype: optional short subtype key (e.g. \"ecog\", \"cns\", \"cardiac\", \
         \"first_line\") used only to look up reference elimination rates\n\n\
         Respond as a JSON object keyed by criterion_id, each value shaped \
         {{\"category\": string, \"queryable_status\": string, \"elimination_rate_percent\": \
         number, \"requires_manual_assessment\": boolean, \"biomarker_subtype\": string?}}.\n\n\
         Criteria:\n{criteria_json}"
    )
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    category: String,
    queryable_status: String,
    #[serde(default)]
    elimination_rate_percent: f64,
    #[serde(default)]
    requires_manual_assessment: bool,
    #[serde(default)]
    biomarker_subtype: Option<String>,
}

fn parse_classification_response(raw: &str) -> HashMap<String, Classification> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "stage11 classification response was not valid JSON");
            return HashMap::new();
        }
    };
    let Some(object) = value.as_object() else {
        warn!("stage11 classification response was not a JSON object");
        return HashMap::new();
    };

    let mut out = HashMap::new();
    for (criterion_id, entry) in object {
        match serde_json::from_value::<RawClassification>(entry.clone()) {
            Ok(raw) => {
                out.insert(
                    criterion_id.clone(),
                    Classification {
                        category: parse_category(&raw.category),
                        queryable_status: parse_queryable_status(&raw.queryable_status),
                        elimination_rate: raw.elimination_rate_percent.clamp(0.0, 100.0),
                        requires_manual_assessment: raw.requires_manual_assessment,
                        biomarker_subtype: raw.biomarker_subtype,
                    },
                );
            }
            Err(err) => {
                warn!(criterion_id = %criterion_id, error = %err, "stage11 classification entry failed to parse");
            }
        }
    }
    out
}

fn parse_category(raw: &str) -> KeyCriterionCategory {
    match raw {
        "primary_anchor" => KeyCriterionCategory::PrimaryAnchor,
        "biomarker" => KeyCriterionCategory::Biomarker,
        "treatment_history" => KeyCriterionCategory::TreatmentHistory,
        "functional" => KeyCriterionCategory::Functional,
        "safety_exclusion" => KeyCriterionCategory::SafetyExclusion,
        _ => KeyCriterionCategory::Administrative,
    }
}

fn parse_queryable_status(raw: &str) -> QueryableStatus {
    match raw {
        "fully_queryable" => QueryableStatus::FullyQueryable,
        "partially_queryable" => QueryableStatus::PartiallyQueryable,
        "reference_based" => QueryableStatus::ReferenceBased,
        _ => QueryableStatus::NonQueryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::raw_criterion::CriterionType;

    fn criterion(id: &str, criterion_type: CriterionType, text: &str) -> RawCriterion {
        RawCriterion {
            criterion_id: id.to_string(),
            criterion_type,
            text: text.to_string(),
            provenance: None,
        }
    }

    fn stage() -> Stage11Feasibility {
        let reference_data = ReferenceDataManager::bundled();
        Stage11Feasibility::new(
            Arc::new(LlmGateway::new(
                &crate::config::PipelineConfig::for_tests(),
                Arc::new(crate::cache::LlmDecisionCache::open(&std::env::temp_dir().join("stage11_test_cache.json"), "test").unwrap()),
            )),
            Arc::new(PopulationEstimator::new(reference_data.clone())),
            reference_data,
        )
    }

    #[test]
    fn fallback_classification_is_conservative() {
        let classification = fallback_classification();
        assert!(classification.requires_manual_assessment);
        assert_eq!(classification.queryable_status, QueryableStatus::NonQueryable);
    }

    #[test]
    fn parse_classification_handles_wellformed_response() {
        let raw = r#"{"INC_1": {"category": "primary_anchor", "queryable_status": "fully_queryable", "elimination_rate_percent": 90.0, "requires_manual_assessment": false}}"#;
        let parsed = parse_classification_response(raw);
        let c = parsed.get("INC_1").unwrap();
        assert_eq!(c.category, KeyCriterionCategory::PrimaryAnchor);
        assert_eq!(c.queryable_status, QueryableStatus::FullyQueryable);
        assert_eq!(c.elimination_rate, 90.0);
    }

    #[test]
    fn parse_classification_malformed_json_yields_empty_map() {
        assert!(parse_classification_response("not json").is_empty());
    }

    #[test]
    fn composite_score_favors_primary_anchor() {
        let stage = stage();
        let anchor = KeyCriterion {
            key_id: "INC_1".into(),
            original_criterion_ids: vec!["INC_1".into()],
            category: KeyCriterionCategory::PrimaryAnchor,
            queryable_status: QueryableStatus::FullyQueryable,
            estimated_elimination_rate: 50.0,
            requires_manual_assessment: false,
            is_killer_criterion: false,
            funnel_priority: 0,
            omop_mappings: vec![],
        };
        let admin = KeyCriterion {
            category: KeyCriterionCategory::Administrative,
            key_id: "EXC_9".into(),
            ..anchor.clone()
        };
        assert!(stage.composite_score(&anchor) > stage.composite_score(&admin));
    }

    #[tokio::test]
    async fn run_always_includes_primary_anchor_and_respects_cap() {
        let stage = stage();
        let mut criteria = Vec::new();
        criteria.push(criterion("INC_1", CriterionType::Inclusion, "Histologically confirmed NSCLC"));
        for i in 0..20 {
            criteria.push(criterion(&format!("EXC_{i}"), CriterionType::Exclusion, "Administrative criterion"));
        }
        let (result, _warnings) = stage.run(&criteria, &[], 1_000_000).await.unwrap();
        let all_ids: Vec<&str> = result
            .stages
            .iter()
            .flat_map(|s| s.key_criteria.iter())
            .map(|k| k.key_id.as_str())
            .collect();
        assert!(all_ids.len() <= MAX_KEY_CRITERIA);
        assert!(result.is_monotonic());
        assert!(result.killer_ids_reference_known_criteria());
    }
}
