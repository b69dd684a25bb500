//! `Qeb` (Queryable Eligibility Block) and `QebOutput`, produced by
//! Stage 12.

use crate::domain::atomic::Atomic;
use crate::domain::funnel::FunnelStage;
use crate::domain::mapping::{FhirMapping, OmopMapping};
use serde::{Deserialize, Serialize};

/// Data-source classification: where the answering
/// evidence for an atomic actually lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    EhrStructured,
    PathologyReport,
    RadiologyReport,
    ClinicalNotes,
    RealTimeAssessment,
    ClinicalJudgment,
    CalculatedValue,
    PatientDecision,
}

impl DataSource {
    /// Whether this source is itself "structured EHR" for the purposes of
    /// the data-source/mapping decision table in [`QebQueryableStatus::from_data_source`].
    pub fn is_ehr_structured(&self) -> bool {
        matches!(self, Self::EhrStructured)
    }

    pub fn is_unstructured_document(&self) -> bool {
        matches!(self, Self::PathologyReport | Self::RadiologyReport | Self::ClinicalNotes)
    }
}

/// QEB-level queryable status, aggregated from atomic-level data-source
/// classification. Distinct from
/// [`crate::domain::key_criterion::QueryableStatus`], which classifies a
/// *selected key criterion* rather than a QEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QebQueryableStatus {
    RequiresManual,
    ScreeningOnly,
    LlmExtractable,
    HybridQueryable,
    PartiallyQueryable,
    FullyQueryable,
    NotApplicable,
}

impl QebQueryableStatus {
    /// Most-restrictive-wins ordering: higher rank
    /// means more restrictive and wins aggregation.
    pub fn restrictiveness_rank(&self) -> u8 {
        match self {
            Self::RequiresManual => 6,
            Self::ScreeningOnly => 5,
            Self::LlmExtractable => 4,
            Self::HybridQueryable => 3,
            Self::PartiallyQueryable => 2,
            Self::FullyQueryable => 1,
            Self::NotApplicable => 0,
        }
    }

    /// Determine an atomic's status from `(dataSource, hasOmopMapping)`.
    pub fn from_data_source(source: DataSource, has_omop_mapping: bool) -> Self {
        match source {
            DataSource::PatientDecision => Self::NotApplicable,
            DataSource::RealTimeAssessment | DataSource::ClinicalJudgment | DataSource::CalculatedValue => {
                Self::ScreeningOnly
            }
            _ if source.is_unstructured_document() && has_omop_mapping => Self::HybridQueryable,
            _ if source.is_unstructured_document() => Self::LlmExtractable,
            _ if source.is_ehr_structured() && has_omop_mapping => Self::FullyQueryable,
            _ => Self::LlmExtractable,
        }
    }

    /// Aggregate a set of atomic-level statuses into a single QEB status by
    /// most-restrictive-wins (`argmax restrictivenessRank`).
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a QebQueryableStatus>) -> Self {
        statuses
            .into_iter()
            .copied()
            .max_by_key(|s| s.restrictiveness_rank())
            .unwrap_or(Self::NotApplicable)
    }
}

/// One-direction state machine for a QEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QebState {
    Raw,
    Named,
    Assessed,
    Staged,
    Finalized,
}

impl QebState {
    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_transition_to(&self, next: QebState) -> bool {
        next > *self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdiscBiomedicalConcept {
    pub concept_name: String,
    pub cdisc_code: String,
    pub domain: String,
    pub rationale: String,
    pub confidence: f64,
}

impl CdiscBiomedicalConcept {
    /// Clamp confidence and truncate string lengths to the limits enforced
    /// at Stage 7 compliance (name 150, code 20, rationale 200) - reused
    /// here since Stage 12 emits the same shape.
    pub fn sanitized(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.concept_name.truncate(150);
        self.cdisc_code.truncate(20);
        self.rationale.truncate(200);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalConceptGroup {
    pub group_name: String,
    pub atomic_ids: Vec<String>,
    pub screening_only_requirements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalSummary {
    pub concept_groups: Vec<ClinicalConceptGroup>,
    pub plain_english_logic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qeb {
    pub criterion_id: String,
    pub state: QebState,
    pub combined_sql: String,
    pub clinical_name: Option<String>,
    pub clinical_description: Option<String>,
    pub clinical_category: Option<String>,
    pub internal_logic: String,
    pub funnel_stage: Option<String>,
    pub funnel_order: Option<u32>,
    pub queryable_status: QebQueryableStatus,
    pub omop_concepts: Vec<OmopMapping>,
    pub fhir_resources: Vec<FhirMapping>,
    pub cdisc_concepts: Vec<CdiscBiomedicalConcept>,
    pub clinical_summary: Option<ClinicalSummary>,
    pub atomics: Vec<Atomic>,
}

impl Qeb {
    /// Deduplicate OMOP concepts by `concept_id`, keeping first occurrence.
    pub fn dedupe_omop_concepts(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.omop_concepts.retain(|c| seen.insert(c.concept_id));
    }

    /// Transition to the next lifecycle state; errors if the transition
    /// would move backward.
    pub fn transition(&mut self, next: QebState) -> Result<(), String> {
        if self.state.can_transition_to(next) {
            self.state = next;
            Ok(())
        } else {
            Err(format!("illegal QEB transition {:?} -> {:?}", self.state, next))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGuide {
    pub recommended_order: Vec<String>,
    pub killer_criteria: Vec<String>,
    pub manual_review_required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QebOutput {
    pub summary_counts: std::collections::HashMap<String, u64>,
    pub funnel_stages: Vec<FunnelStage>,
    pub queryable_blocks: Vec<Qeb>,
    pub atomic_criteria: Vec<Atomic>,
    pub logical_groups: Vec<String>,
    pub execution_guide: ExecutionGuide,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrictiveness_ordering_is_most_restrictive_first() {
        assert!(
            QebQueryableStatus::RequiresManual.restrictiveness_rank()
                > QebQueryableStatus::ScreeningOnly.restrictiveness_rank()
        );
        assert!(
            QebQueryableStatus::ScreeningOnly.restrictiveness_rank()
                > QebQueryableStatus::LlmExtractable.restrictiveness_rank()
        );
        assert!(
            QebQueryableStatus::LlmExtractable.restrictiveness_rank()
                > QebQueryableStatus::HybridQueryable.restrictiveness_rank()
        );
        assert!(
            QebQueryableStatus::HybridQueryable.restrictiveness_rank()
                > QebQueryableStatus::PartiallyQueryable.restrictiveness_rank()
        );
        assert!(
            QebQueryableStatus::PartiallyQueryable.restrictiveness_rank()
                > QebQueryableStatus::FullyQueryable.restrictiveness_rank()
        );
        assert!(
            QebQueryableStatus::FullyQueryable.restrictiveness_rank()
                > QebQueryableStatus::NotApplicable.restrictiveness_rank()
        );
    }

    #[test]
    fn aggregate_picks_most_restrictive() {
        let statuses = vec![
            QebQueryableStatus::FullyQueryable,
            QebQueryableStatus::ScreeningOnly,
            QebQueryableStatus::NotApplicable,
        ];
        assert_eq!(QebQueryableStatus::aggregate(&statuses), QebQueryableStatus::ScreeningOnly);
    }

    #[test]
    fn data_source_decision_table() {
        assert_eq!(
            QebQueryableStatus::from_data_source(DataSource::PatientDecision, true),
            QebQueryableStatus::NotApplicable
        );
        assert_eq!(
            QebQueryableStatus::from_data_source(DataSource::ClinicalJudgment, true),
            QebQueryableStatus::ScreeningOnly
        );
        assert_eq!(
            QebQueryableStatus::from_data_source(DataSource::ClinicalNotes, true),
            QebQueryableStatus::HybridQueryable
        );
        assert_eq!(
            QebQueryableStatus::from_data_source(DataSource::ClinicalNotes, false),
            QebQueryableStatus::LlmExtractable
        );
        assert_eq!(
            QebQueryableStatus::from_data_source(DataSource::EhrStructured, true),
            QebQueryableStatus::FullyQueryable
        );
        assert_eq!(
            QebQueryableStatus::from_data_source(DataSource::EhrStructured, false),
            QebQueryableStatus::LlmExtractable
        );
    }

    #[test]
    fn state_machine_is_one_direction_only() {
        assert!(QebState::Raw.can_transition_to(QebState::Named));
        assert!(!QebState::Finalized.can_transition_to(QebState::Raw));
        assert!(!QebState::Assessed.can_transition_to(QebState::Assessed));
    }
}
