//! `KeyCriterion`: a selected/prioritized criterion for the funnel.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCriterionCategory {
    PrimaryAnchor,
    Biomarker,
    TreatmentHistory,
    Functional,
    SafetyExclusion,
    Administrative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryableStatus {
    FullyQueryable,
    PartiallyQueryable,
    NonQueryable,
    ReferenceBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyCriterion {
    pub key_id: String,
    pub original_criterion_ids: Vec<String>,
    pub category: KeyCriterionCategory,
    pub queryable_status: QueryableStatus,
    pub estimated_elimination_rate: f64,
    pub requires_manual_assessment: bool,
    pub is_killer_criterion: bool,
    pub funnel_priority: u32,
    pub omop_mappings: Vec<crate::domain::mapping::OmopMapping>,
}

impl KeyCriterion {
    pub fn is_queryable(&self) -> bool {
        matches!(
            self.queryable_status,
            QueryableStatus::FullyQueryable | QueryableStatus::PartiallyQueryable
        )
    }

    /// `data_availability` weight used by the composite selection score
    ///: query adapters give a strong signal when fully
    /// queryable, a partial one otherwise.
    pub fn data_availability_weight(&self) -> f64 {
        match self.queryable_status {
            QueryableStatus::FullyQueryable => 1.0,
            QueryableStatus::PartiallyQueryable => 0.6,
            QueryableStatus::ReferenceBased => 0.4,
            QueryableStatus::NonQueryable => 0.0,
        }
    }
}
