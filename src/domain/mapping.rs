//! OMOP/FHIR concept mappings and the mapped-atomic they attach to.

use crate::domain::atomic::Atomic;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmopMapping {
    pub concept_id: i64,
    pub concept_name: String,
    pub vocabulary_id: String,
    pub domain_id: String,
    pub table_name: String,
    pub is_standard: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FhirMapping {
    pub resource_type: String,
    pub code_system: String,
    pub code: String,
    pub search_parameter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticVerdict {
    Valid,
    NotValid,
    Uncertain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedAtomic {
    pub atomic: Atomic,
    /// At most one primary mapping; additional candidates retained for audit.
    pub primary_omop: Option<OmopMapping>,
    pub secondary_omop: Vec<OmopMapping>,
    pub fhir: Vec<FhirMapping>,
    pub validation_confidence: f64,
    pub semantic_verdict: SemanticVerdict,
}

impl MappedAtomic {
    pub fn unmapped(atomic: Atomic) -> Self {
        Self {
            atomic,
            primary_omop: None,
            secondary_omop: Vec::new(),
            fhir: Vec::new(),
            validation_confidence: 0.0,
            semantic_verdict: SemanticVerdict::Uncertain,
        }
    }

    pub fn has_omop_mapping(&self) -> bool {
        self.primary_omop.is_some()
    }
}
