//! `FunnelStage` / `FunnelResult`: the ordered patient-funnel model produced
//! by Stage 11.

use crate::domain::key_criterion::KeyCriterion;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStageType {
    DiseaseIndication,
    Demographics,
    BiomarkerRequirements,
    TreatmentHistory,
    PerformanceStatus,
    LabCriteria,
    SafetyExclusions,
}

impl FunnelStageType {
    /// Fixed construction order.
    pub const ORDER: [FunnelStageType; 7] = [
        FunnelStageType::DiseaseIndication,
        FunnelStageType::Demographics,
        FunnelStageType::BiomarkerRequirements,
        FunnelStageType::TreatmentHistory,
        FunnelStageType::PerformanceStatus,
        FunnelStageType::LabCriteria,
        FunnelStageType::SafetyExclusions,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::DiseaseIndication => "Disease Indication",
            Self::Demographics => "Demographics",
            Self::BiomarkerRequirements => "Biomarker Requirements",
            Self::TreatmentHistory => "Treatment History",
            Self::PerformanceStatus => "Performance Status",
            Self::LabCriteria => "Lab Criteria",
            Self::SafetyExclusions => "Safety Exclusions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStage {
    pub name: String,
    pub stage_type: FunnelStageType,
    pub order: u32,
    pub key_criteria: Vec<KeyCriterion>,
    pub patients_entering: u64,
    pub patients_exiting: u64,
    pub elimination_rate: f64,
    pub execution_time_ms: u64,
}

impl FunnelStage {
    /// `stage[i].patientsExiting <= stage[i].patientsEntering`.
    pub fn is_monotonic(&self) -> bool {
        self.patients_exiting <= self.patients_entering
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulationEstimateMethod {
    Query,
    Prevalence,
    Hybrid,
}

impl PopulationEstimateMethod {
    /// Confidence intervals widened by method:
    /// query ±15%, prevalence ±30%, hybrid ±20%.
    pub fn confidence_width(&self) -> f64 {
        match self {
            Self::Query => 0.15,
            Self::Prevalence => 0.30,
            Self::Hybrid => 0.20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationEstimate {
    pub count: u64,
    pub confidence_low: u64,
    pub confidence_high: u64,
    pub method: PopulationEstimateMethod,
}

impl PopulationEstimate {
    pub fn new(count: u64, method: PopulationEstimateMethod) -> Self {
        let width = method.confidence_width();
        let low = (count as f64 * (1.0 - width)).max(0.0).round() as u64;
        let high = (count as f64 * (1.0 + width)).round() as u64;
        Self {
            count,
            confidence_low: low,
            confidence_high: high,
            method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOpportunity {
    pub description: String,
    pub affected_stage: String,
    pub potential_impact: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRanking {
    pub site_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelResult {
    pub stages: Vec<FunnelStage>,
    pub killer_criterion_ids: Vec<String>,
    pub optimization_opportunities: Vec<OptimizationOpportunity>,
    pub site_rankings: Vec<SiteRanking>,
    pub population_estimate: PopulationEstimate,
}

impl FunnelResult {
    /// Funnel monotonicity across the whole chain:
    /// `stage[i].patientsExiting <= stage[i].patientsEntering <= stage[i-1].patientsExiting`.
    pub fn is_monotonic(&self) -> bool {
        if !self.stages.iter().all(FunnelStage::is_monotonic) {
            return false;
        }
        self.stages
            .windows(2)
            .all(|pair| pair[1].patients_entering <= pair[0].patients_exiting)
    }

    /// Killer referencing: every killer id must be a key-criterion id.
    pub fn killer_ids_reference_known_criteria(&self) -> bool {
        let known: std::collections::HashSet<&str> = self
            .stages
            .iter()
            .flat_map(|s| s.key_criteria.iter())
            .map(|k| k.key_id.as_str())
            .collect();
        self.killer_criterion_ids.iter().all(|id| known.contains(id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::key_criterion::{KeyCriterionCategory, QueryableStatus};

    fn key_criterion(id: &str) -> KeyCriterion {
        KeyCriterion {
            key_id: id.to_string(),
            original_criterion_ids: vec![],
            category: KeyCriterionCategory::PrimaryAnchor,
            queryable_status: QueryableStatus::FullyQueryable,
            estimated_elimination_rate: 50.0,
            requires_manual_assessment: false,
            is_killer_criterion: true,
            funnel_priority: 0,
            omop_mappings: vec![],
        }
    }

    fn stage(entering: u64, exiting: u64) -> FunnelStage {
        FunnelStage {
            name: "Disease Indication".into(),
            stage_type: FunnelStageType::DiseaseIndication,
            order: 0,
            key_criteria: vec![key_criterion("K1")],
            patients_entering: entering,
            patients_exiting: exiting,
            elimination_rate: 1.0 - (exiting as f64 / entering as f64),
            execution_time_ms: 10,
        }
    }

    #[test]
    fn monotonic_chain_passes() {
        let result = FunnelResult {
            stages: vec![stage(1_000_000, 50_000), stage(50_000, 10_000)],
            killer_criterion_ids: vec!["K1".into()],
            optimization_opportunities: vec![],
            site_rankings: vec![],
            population_estimate: PopulationEstimate::new(10_000, PopulationEstimateMethod::Query),
        };
        assert!(result.is_monotonic());
        assert!(result.killer_ids_reference_known_criteria());
    }

    #[test]
    fn non_monotonic_chain_fails() {
        let result = FunnelResult {
            stages: vec![stage(1_000, 2_000)],
            killer_criterion_ids: vec![],
            optimization_opportunities: vec![],
            site_rankings: vec![],
            population_estimate: PopulationEstimate::new(2_000, PopulationEstimateMethod::Query),
        };
        assert!(!result.is_monotonic());
    }

    #[test]
    fn killer_id_must_reference_known_key_criterion() {
        let result = FunnelResult {
            stages: vec![stage(100, 50)],
            killer_criterion_ids: vec!["GHOST".into()],
            optimization_opportunities: vec![],
            site_rankings: vec![],
            population_estimate: PopulationEstimate::new(50, PopulationEstimateMethod::Query),
        };
        assert!(!result.killer_ids_reference_known_criteria());
    }

    #[test]
    fn confidence_interval_widens_by_method() {
        let query = PopulationEstimate::new(1000, PopulationEstimateMethod::Query);
        let prevalence = PopulationEstimate::new(1000, PopulationEstimateMethod::Prevalence);
        assert!(query.confidence_high - query.confidence_low < prevalence.confidence_high - prevalence.confidence_low);
    }
}
