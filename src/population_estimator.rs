//! Population Estimator: combines prevalence tables,
//! biomarker frequency tables, and screen-failure elimination rates into
//! the sequential patient funnel Stage 11 emits. Grounded in the
//! original's `PopulationEstimator`, minus its standalone confidence-
//! interval math (the simpler per-method width model already defined on
//! [`crate::domain::funnel::PopulationEstimateMethod`] is reused instead
//! of re-deriving a z-score-scaled interval, ).

use std::sync::Arc;

use crate::domain::funnel::{
    FunnelStage, FunnelStageType, OptimizationOpportunity, PopulationEstimate, PopulationEstimateMethod,
};
use crate::domain::key_criterion::{KeyCriterion, KeyCriterionCategory};
use crate::reference_data::ReferenceDataManager;

pub struct PopulationEstimator {
    reference_data: Arc<ReferenceDataManager>,
}

impl PopulationEstimator {
    pub fn new(reference_data: Arc<ReferenceDataManager>) -> Self {
        Self { reference_data }
    }

    /// Prevalence-based disease population. Unknown disease
    /// keys fall back to a conservative 0.1% of `base_population`.
    pub fn estimate_disease_population(&self, disease_key: &str, base_population: u64) -> PopulationEstimate {
        let prevalence_rate = self.reference_data.get_condition_prevalence(disease_key, 10.0);
        if prevalence_rate <= 0.0 {
            let count = (base_population as f64 * 0.001) as u64;
            return PopulationEstimate::new(count, PopulationEstimateMethod::Prevalence);
        }
        let count = (base_population as f64 * prevalence_rate) as u64;
        PopulationEstimate::new(count, PopulationEstimateMethod::Prevalence)
    }

    /// Biomarker-positive population within a disease cohort.
    pub fn estimate_biomarker_population(
        &self,
        tumor_type: &str,
        biomarker: &str,
        disease_population: u64,
    ) -> PopulationEstimate {
        let frequency = self.reference_data.get_biomarker_frequency(tumor_type, biomarker, 0.10);
        let count = (disease_population as f64 * frequency) as u64;
        PopulationEstimate::new(count, PopulationEstimateMethod::Prevalence)
    }

    /// Screen-failure elimination rate applied to a population for a
    /// criterion category/subtype; returns `(adjusted_population,
    /// elimination_rate_percent)`.
    pub fn apply_screen_fail_adjustment(
        &self,
        population: u64,
        category: KeyCriterionCategory,
        subtype: Option<&str>,
    ) -> (u64, f64) {
        let rate = match category {
            KeyCriterionCategory::Functional => self.reference_data.get_screen_fail_rate("functional", subtype, 0.20),
            KeyCriterionCategory::SafetyExclusion => {
                self.reference_data.get_screen_fail_rate("safety_exclusion", subtype, 0.10)
            }
            KeyCriterionCategory::TreatmentHistory => {
                self.reference_data.get_screen_fail_rate("treatment_history", subtype, 0.25)
            }
            // Biomarker elimination is already captured via frequency tables.
            KeyCriterionCategory::Biomarker => 0.0,
            KeyCriterionCategory::Administrative => 0.05,
            KeyCriterionCategory::PrimaryAnchor => 0.0,
        };
        let adjusted = (population as f64 * (1.0 - rate)) as u64;
        (adjusted, rate * 100.0)
    }

    fn stage_type_for(category: KeyCriterionCategory) -> FunnelStageType {
        match category {
            KeyCriterionCategory::PrimaryAnchor => FunnelStageType::DiseaseIndication,
            KeyCriterionCategory::Biomarker => FunnelStageType::BiomarkerRequirements,
            KeyCriterionCategory::TreatmentHistory => FunnelStageType::TreatmentHistory,
            KeyCriterionCategory::Functional => FunnelStageType::PerformanceStatus,
            KeyCriterionCategory::SafetyExclusion => FunnelStageType::SafetyExclusions,
            KeyCriterionCategory::Administrative => FunnelStageType::Demographics,
        }
    }

    /// Build the sequential patient funnel: key criteria are
    /// grouped by funnel-stage category in fixed
    /// [`FunnelStageType::ORDER`], and each stage's elimination rate is
    /// applied to the running population in sequence. Exclusion criteria
    /// eliminate `eliminationRate`; inclusion criteria eliminate
    /// `1 - eliminationRate` (only patients meeting the requirement pass).
    pub fn build_funnel(&self, key_criteria: &[KeyCriterion], base_population: u64) -> Vec<FunnelStage> {
        let mut stages = Vec::new();
        let mut current_population = base_population;

        for (order, stage_type) in FunnelStageType::ORDER.iter().enumerate() {
            let in_stage: Vec<&KeyCriterion> = key_criteria
                .iter()
                .filter(|k| Self::stage_type_for(k.category) == *stage_type)
                .collect();
            if in_stage.is_empty() {
                continue;
            }

            let entering = current_population;
            let mut exiting = entering;
            for criterion in &in_stage {
                let fraction = criterion.estimated_elimination_rate / 100.0;
                let retained = if criterion_is_exclusion(criterion) {
                    1.0 - fraction
                } else {
                    fraction
                };
                exiting = (exiting as f64 * retained).round() as u64;
            }
            exiting = exiting.min(entering);
            current_population = exiting;

            let elimination_rate = if entering == 0 {
                0.0
            } else {
                1.0 - (exiting as f64 / entering as f64)
            };

            stages.push(FunnelStage {
                name: stage_type.display_name().to_string(),
                stage_type: *stage_type,
                order: order as u32,
                key_criteria: in_stage.into_iter().cloned().collect(),
                patients_entering: entering,
                patients_exiting: exiting,
                elimination_rate,
                execution_time_ms: 0,
            });
        }

        stages
    }

    /// Surface the benchmark optimization opportunities that apply to a
    /// funnel: anything in the reference bundle whose
    /// affected stage appears in the computed funnel.
    pub fn optimization_opportunities(&self, stages: &[FunnelStage]) -> Vec<OptimizationOpportunity> {
        let present: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        ["broaden_ecog", "relax_washout"]
            .iter()
            .filter_map(|key| self.reference_data.get_optimization_opportunity(key))
            .filter(|(_, stage, _)| present.iter().any(|name| stage.contains(name) || name.contains(stage.as_str())))
            .map(|(description, affected_stage, potential_impact)| OptimizationOpportunity {
                description,
                affected_stage,
                potential_impact,
            })
            .collect()
    }
}

/// Safety-exclusion criteria eliminate the patients who meet them (the
/// `eliminationRate` itself is the fraction excluded); every other
/// category is an inclusion gate, where only the fraction meeting the
/// requirement survives.
fn criterion_is_exclusion(criterion: &KeyCriterion) -> bool {
    criterion.category == KeyCriterionCategory::SafetyExclusion
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::key_criterion::QueryableStatus;

    fn estimator() -> PopulationEstimator {
        PopulationEstimator::new(ReferenceDataManager::bundled())
    }

    #[test]
    fn disease_population_uses_prevalence_table() {
        let est = estimator();
        let pop = est.estimate_disease_population("NSCLC", 1_000_000);
        assert_eq!(pop.count, 540);
        assert_eq!(pop.method, PopulationEstimateMethod::Prevalence);
    }

    #[test]
    fn unknown_disease_falls_back_to_conservative_default() {
        let est = estimator();
        let pop = est.estimate_disease_population("not_a_real_disease", 1_000_000);
        assert_eq!(pop.count, 1_000);
    }

    #[test]
    fn screen_fail_adjustment_reduces_population() {
        let est = estimator();
        let (adjusted, rate) = est.apply_screen_fail_adjustment(1000, KeyCriterionCategory::Functional, Some("ecog"));
        assert_eq!(adjusted, 800);
        assert_eq!(rate, 20.0);
    }

    #[test]
    fn funnel_is_monotonic_across_stages() {
        let est = estimator();
        let criteria = vec![KeyCriterion {
            key_id: "K1".into(),
            original_criterion_ids: vec!["inclusion".into()],
            category: KeyCriterionCategory::PrimaryAnchor,
            queryable_status: QueryableStatus::FullyQueryable,
            estimated_elimination_rate: 90.0,
            requires_manual_assessment: false,
            is_killer_criterion: true,
            funnel_priority: 0,
            omop_mappings: vec![],
        }];
        let stages = est.build_funnel(&criteria, 1_000_000);
        assert_eq!(stages.len(), 1);
        assert!(stages[0].patients_exiting <= stages[0].patients_entering);
    }
}
