//! Stage 6 — SQL Template Generation: lower each mapped atomic
//! into a parametrized OMOP CDM `SELECT DISTINCT person_id` statement, plus
//! a FHIR search-parameter template when the domain has one. Pure, LLM-free
//! lowering - every decision here follows directly from the atomic's table,
//! concept id, and numeric/temporal constraints, so there is nothing for a
//! model to get wrong.

use std::collections::HashMap;

use tracing::instrument;

use crate::domain::atomic::Atomic;
use crate::domain::expression_tree::{AtomicLeaf, ComparisonOperator};
use crate::domain::mapping::MappedAtomic;
use crate::domain::sql_atomic::{OmopTable, SqlAtomic};

pub struct Stage6Sql;

impl Stage6Sql {
    pub fn new() -> Self {
        Self
    }

    /// Lower every mapped atomic to a [`SqlAtomic`]. `leaves_by_id` supplies
    /// the numeric/temporal constraint detail that Stage 2's flat [`Atomic`]
    /// view does not carry forward: `Atomic` is the execution-context
    /// view, `AtomicLeaf` is the full tree-node view).
    #[instrument(skip(self, mapped, leaves_by_id), fields(atomic_count = mapped.len()))]
    pub fn run(&self, mapped: &[MappedAtomic], leaves_by_id: &HashMap<String, AtomicLeaf>) -> Vec<SqlAtomic> {
        mapped
            .iter()
            .map(|m| self.lower_one(m, leaves_by_id.get(&m.atomic.atomic_id)))
            .collect()
    }

    fn lower_one(&self, mapped: &MappedAtomic, leaf: Option<&AtomicLeaf>) -> SqlAtomic {
        let domain = mapped.atomic.domain_hint.as_deref().unwrap_or("Observation");
        let table = mapped
            .primary_omop
            .as_ref()
            .and_then(|m| OmopTable::from_domain(&m.domain_id))
            .or_else(|| OmopTable::from_domain(domain))
            .unwrap_or(OmopTable::Observation);

        let concept_id = mapped.primary_omop.as_ref().map(|m| m.concept_id);
        let numeric_constraint = leaf.and_then(|l| l.numeric_constraint.as_ref());
        let sql = build_select(table, concept_id, numeric_constraint, include_descendants(&mapped.atomic));

        SqlAtomic {
            mapped: mapped.clone(),
            table,
            sql,
            fhir_search: fhir_search_template(table, concept_id),
        }
    }
}

impl Default for Stage6Sql {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomics carrying a clinical concept group are treated as wanting the
/// whole descendant hierarchy rather than one exact concept:
/// "concept_ancestor when hierarchical expansion is requested").
fn include_descendants(atomic: &Atomic) -> bool {
    atomic.clinical_concept_group.is_some()
}

fn build_select(
    table: OmopTable,
    concept_id: Option<i64>,
    numeric_constraint: Option<&crate::domain::expression_tree::NumericConstraint>,
    include_descendants: bool,
) -> String {
    let table_name = table.table_name();
    let concept_col = table.concept_id_column();

    if table == OmopTable::Person {
        return build_demographics_select(numeric_constraint);
    }

    let Some(concept_id) = concept_id else {
        return format!("-- unmapped atomic: no concept_id available for table '{table_name}'");
    };

    let concept_predicate = if include_descendants {
        format!(
            "{concept_col} IN (\n  SELECT descendant_concept_id FROM concept_ancestor \
             WHERE ancestor_concept_id = {concept_id}\n)"
        )
    } else {
        format!("{concept_col} = {concept_id}")
    };

    let mut clauses = vec![concept_predicate];
    if let Some(constraint) = numeric_constraint {
        if table.allows_value_as_number() {
            clauses.push(format!("value_as_number {} {}", constraint.operator.as_sql(), constraint.threshold));
        }
    }

    format!("SELECT DISTINCT person_id FROM {table_name} WHERE {}", clauses.join(" AND "))
}

/// Demographics atomics (age, sex) query `person` directly; age is computed
/// from `year_of_birth` rather than stored, per OMOP CDM convention.
fn build_demographics_select(numeric_constraint: Option<&crate::domain::expression_tree::NumericConstraint>) -> String {
    match numeric_constraint {
        Some(constraint) => format!(
            "SELECT DISTINCT person_id FROM person \
             WHERE (EXTRACT(YEAR FROM CURRENT_DATE) - year_of_birth) {} {}",
            constraint.operator.as_sql(),
            constraint.threshold
        ),
        None => "SELECT DISTINCT person_id FROM person".to_string(),
    }
}

fn fhir_search_template(table: OmopTable, concept_id: Option<i64>) -> Option<String> {
    let concept_id = concept_id?;
    let resource = match table {
        OmopTable::Person => return Some("Patient?birthdate=...".to_string()),
        OmopTable::ConditionOccurrence => "Condition",
        OmopTable::DrugExposure => "MedicationRequest",
        OmopTable::Measurement => "Observation",
        OmopTable::Observation => "Observation",
        OmopTable::ProcedureOccurrence => "Procedure",
        OmopTable::DeviceExposure => "DeviceRequest",
    };
    Some(format!("{resource}?code={concept_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::expression_tree::NumericConstraint;
    use crate::domain::mapping::OmopMapping;
    use crate::domain::raw_criterion::CriterionType;

    fn atomic(domain: &str, concept_group: Option<&str>) -> Atomic {
        Atomic {
            atomic_id: "A1".into(),
            atomic_text: "ANC >= 1500".into(),
            criterion_id: "INC_1".into(),
            criterion_type: CriterionType::Inclusion,
            logical_group: "INC_1.0".into(),
            domain_hint: Some(domain.into()),
            clinical_category: None,
            clinical_concept_group: concept_group.map(|s| s.to_string()),
        }
    }

    fn mapped(domain: &str, concept_group: Option<&str>) -> MappedAtomic {
        MappedAtomic {
            atomic: atomic(domain, concept_group),
            primary_omop: Some(OmopMapping {
                concept_id: 42,
                concept_name: "Absolute neutrophil count".into(),
                vocabulary_id: "LOINC".into(),
                domain_id: domain.into(),
                table_name: OmopTable::from_domain(domain).unwrap().table_name().to_string(),
                is_standard: true,
            }),
            secondary_omop: Vec::new(),
            fhir: Vec::new(),
            validation_confidence: 0.9,
            semantic_verdict: crate::domain::mapping::SemanticVerdict::Valid,
        }
    }

    fn leaf_with_constraint() -> AtomicLeaf {
        AtomicLeaf {
            atomic_id: "A1".into(),
            atomic_text: "ANC >= 1500".into(),
            domain_hint: Some("measurement".into()),
            time_frame: None,
            numeric_constraint: Some(NumericConstraint {
                operator: ComparisonOperator::Ge,
                threshold: 1500.0,
                unit: Some("/mm3".into()),
            }),
            clinical_category: None,
            queryability_hint: None,
            clinical_concept_group: None,
        }
    }

    #[test]
    fn measurement_sql_includes_value_as_number() {
        let mut leaves = HashMap::new();
        leaves.insert("A1".to_string(), leaf_with_constraint());
        let stage = Stage6Sql::new();
        let out = stage.run(&[mapped("measurement", None)], &leaves);
        assert_eq!(out.len(), 1);
        assert!(out[0].sql.contains("value_as_number >= 1500"));
        assert!(out[0].sql.contains("FROM measurement"));
        assert!(out[0].validate_schema().is_ok());
    }

    #[test]
    fn condition_sql_never_references_value_as_number() {
        let leaves = HashMap::new();
        let stage = Stage6Sql::new();
        let out = stage.run(&[mapped("condition", None)], &leaves);
        assert!(!out[0].sql.contains("value_as_number"));
        assert!(out[0].validate_schema().is_ok());
    }

    #[test]
    fn concept_group_triggers_descendant_expansion() {
        let leaves = HashMap::new();
        let stage = Stage6Sql::new();
        let out = stage.run(&[mapped("condition", Some("solid_tumors"))], &leaves);
        assert!(out[0].sql.contains("concept_ancestor"));
    }

    #[test]
    fn demographics_age_computed_from_year_of_birth() {
        let mut leaves = HashMap::new();
        leaves.insert(
            "A1".to_string(),
            AtomicLeaf {
                atomic_id: "A1".into(),
                atomic_text: "Age >= 18".into(),
                domain_hint: Some("demographics".into()),
                time_frame: None,
                numeric_constraint: Some(NumericConstraint {
                    operator: ComparisonOperator::Ge,
                    threshold: 18.0,
                    unit: Some("years".into()),
                }),
                clinical_category: None,
                queryability_hint: None,
                clinical_concept_group: None,
            },
        );
        let stage = Stage6Sql::new();
        let out = stage.run(&[mapped("demographics", None)], &leaves);
        assert!(out[0].sql.contains("year_of_birth"));
        assert!(out[0].sql.contains(">= 18"));
    }

    #[test]
    fn fhir_template_maps_condition_to_condition_resource() {
        let leaves = HashMap::new();
        let stage = Stage6Sql::new();
        let out = stage.run(&[mapped("condition", None)], &leaves);
        assert_eq!(out[0].fhir_search.as_deref(), Some("Condition?code=42"));
    }
}
