//! A single inclusion/exclusion sentence extracted upstream.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionType {
    Inclusion,
    Exclusion,
}

impl CriterionType {
    /// `criterion_type` defaults to inclusion on unknown/missing values.
    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw {
            Some("exclusion") => Self::Exclusion,
            Some("inclusion") => Self::Inclusion,
            _ => Self::Inclusion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub page_number: Option<u32>,
    pub section_id: Option<String>,
    pub text_snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCriterion {
    pub criterion_id: String,
    pub criterion_type: CriterionType,
    pub text: String,
    pub provenance: Option<Provenance>,
}

impl RawCriterion {
    /// Build a criterion, auto-generating a `C{index:03d}` id when one is
    /// not supplied.
    pub fn new_with_fallback_id(
        index: usize,
        criterion_id: Option<String>,
        criterion_type_raw: Option<&str>,
        text: String,
        provenance: Option<Provenance>,
    ) -> Self {
        let criterion_id = criterion_id.unwrap_or_else(|| format!("C{index:03}"));
        Self {
            criterion_id,
            criterion_type: CriterionType::parse_or_default(criterion_type_raw),
            text,
            provenance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_criterion_id_is_auto_generated() {
        let c = RawCriterion::new_with_fallback_id(3, None, Some("inclusion"), "Age >= 18".into(), None);
        assert_eq!(c.criterion_id, "C003");
    }

    #[test]
    fn unknown_criterion_type_defaults_to_inclusion() {
        let c = RawCriterion::new_with_fallback_id(
            0,
            Some("INC_1".into()),
            Some("something_else"),
            "text".into(),
            None,
        );
        assert_eq!(c.criterion_type, CriterionType::Inclusion);
    }

    #[test]
    fn explicit_exclusion_is_preserved() {
        let c = RawCriterion::new_with_fallback_id(0, Some("EXC_1".into()), Some("exclusion"), "text".into(), None);
        assert_eq!(c.criterion_type, CriterionType::Exclusion);
    }
}
