//! `SqlAtomic`: a mapped atomic plus its parametrized OMOP CDM SELECT.

use crate::domain::mapping::MappedAtomic;
use crate::validation::{ValidationError, ValidationResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmopTable {
    Person,
    ConditionOccurrence,
    DrugExposure,
    Measurement,
    Observation,
    ProcedureOccurrence,
    DeviceExposure,
}

impl OmopTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::ConditionOccurrence => "condition_occurrence",
            Self::DrugExposure => "drug_exposure",
            Self::Measurement => "measurement",
            Self::Observation => "observation",
            Self::ProcedureOccurrence => "procedure_occurrence",
            Self::DeviceExposure => "device_exposure",
        }
    }

    /// Each table has exactly one canonical `*_concept_id` column.
    pub fn concept_id_column(&self) -> &'static str {
        match self {
            Self::Person => "gender_concept_id",
            Self::ConditionOccurrence => "condition_concept_id",
            Self::DrugExposure => "drug_concept_id",
            Self::Measurement => "measurement_concept_id",
            Self::Observation => "observation_concept_id",
            Self::ProcedureOccurrence => "procedure_concept_id",
            Self::DeviceExposure => "device_concept_id",
        }
    }

    /// Only `measurement`/`observation` may reference
    /// `value_as_number`/`value_as_concept_id`.
    pub fn allows_value_as_number(&self) -> bool {
        matches!(self, Self::Measurement | Self::Observation)
    }

    pub fn from_domain(domain: &str) -> Option<Self> {
        match domain.to_lowercase().as_str() {
            "condition" => Some(Self::ConditionOccurrence),
            "drug" => Some(Self::DrugExposure),
            "measurement" => Some(Self::Measurement),
            "procedure" => Some(Self::ProcedureOccurrence),
            "observation" => Some(Self::Observation),
            "device" => Some(Self::DeviceExposure),
            "demographics" | "person" => Some(Self::Person),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlAtomic {
    pub mapped: MappedAtomic,
    pub table: OmopTable,
    /// Parametrized OMOP CDM SELECT returning `DISTINCT person_id`.
    pub sql: String,
    /// FHIR-side search-parameter template, when applicable.
    pub fhir_search: Option<String>,
}

impl SqlAtomic {
    /// Schema validity: `value_as_number` appears only in SELECTs
    /// over `measurement` or `observation`; the table's canonical
    /// `*_concept_id` column must be the one actually referenced.
    pub fn validate_schema(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let lower = self.sql.to_lowercase();

        if lower.contains("value_as_number") && !self.table.allows_value_as_number() {
            errors.push(ValidationError::constraint_violated(
                "sql",
                format!(
                    "value_as_number referenced against table '{}' which does not support it",
                    self.table.table_name()
                ),
            ));
        }

        if !lower.contains(&format!("from {}", self.table.table_name())) {
            errors.push(ValidationError::constraint_violated(
                "sql",
                format!("SELECT does not target declared table '{}'", self.table.table_name()),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::atomic::Atomic;
    use crate::domain::mapping::MappedAtomic;
    use crate::domain::raw_criterion::CriterionType;

    fn atomic() -> Atomic {
        Atomic {
            atomic_id: "A1".into(),
            atomic_text: "ANC >= 1500".into(),
            criterion_id: "INC_1".into(),
            criterion_type: CriterionType::Inclusion,
            logical_group: "INC_1.0".into(),
            domain_hint: Some("measurement".into()),
            clinical_category: None,
            clinical_concept_group: None,
        }
    }

    #[test]
    fn value_as_number_allowed_on_measurement() {
        let sql = SqlAtomic {
            mapped: MappedAtomic::unmapped(atomic()),
            table: OmopTable::Measurement,
            sql: "SELECT DISTINCT person_id FROM measurement WHERE measurement_concept_id = 1 AND value_as_number >= 1500".into(),
            fhir_search: None,
        };
        assert!(sql.validate_schema().is_ok());
    }

    #[test]
    fn value_as_number_rejected_on_condition_occurrence() {
        let sql = SqlAtomic {
            mapped: MappedAtomic::unmapped(atomic()),
            table: OmopTable::ConditionOccurrence,
            sql: "SELECT DISTINCT person_id FROM condition_occurrence WHERE value_as_number >= 1".into(),
            fhir_search: None,
        };
        assert!(sql.validate_schema().is_err());
    }

    #[test]
    fn table_from_domain_mapping() {
        assert_eq!(OmopTable::from_domain("Measurement"), Some(OmopTable::Measurement));
        assert_eq!(OmopTable::from_domain("unknown"), None);
    }
}
