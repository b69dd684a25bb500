//! Stage 12 — Queryable Eligibility Block Builder: the final
//! stage, folding a criterion's expression tree, SQL atomics, OMOP/FHIR
//! mappings, and Stage 11's funnel placement into one deployable `Qeb` per
//! criterion, then assembling the overall `QebOutput`.
//!
//! The combined-SQL lowering (step 2) is pure tree recursion - no LLM
//! involvement, since the operator-to-set-operation mapping is fixed.
//! Everything clinical (naming, data-source classification, CDISC
//! enrichment) goes through the gateway, batched per criterion so a model
//! failure degrades one QEB rather than the whole stage.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::domain::atomic::Atomic;
use crate::domain::expression_tree::ExpressionTree;
use crate::domain::funnel::FunnelResult;
use crate::domain::mapping::{FhirMapping, MappedAtomic, OmopMapping};
use crate::domain::qeb::{
    CdiscBiomedicalConcept, ClinicalConceptGroup, ClinicalSummary, DataSource, ExecutionGuide, Qeb, QebOutput,
    QebQueryableStatus, QebState,
};
use crate::domain::raw_criterion::RawCriterion;
use crate::domain::sql_atomic::SqlAtomic;
use crate::error::Result;
use crate::gateway::LlmGateway;

pub struct Stage12QebBuilder {
    gateway: Arc<LlmGateway>,
}

impl Stage12QebBuilder {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    #[instrument(skip(self, criteria, trees, sql_atomics, mapped), fields(criterion_count = criteria.len()))]
    pub async fn run(
        &self,
        criteria: &[RawCriterion],
        trees: &HashMap<String, ExpressionTree>,
        sql_atomics: &[SqlAtomic],
        mapped: &[MappedAtomic],
        funnel: &FunnelResult,
    ) -> Result<(QebOutput, Vec<String>)> {
        let sql_by_atomic_id = index_sql_atomics(sql_atomics);
        let mapped_by_atomic_id = index_mapped(mapped);
        let funnel_placement = index_funnel_placement(funnel);

        let mut warnings = Vec::new();
        let mut blocks = Vec::with_capacity(criteria.len());
        let mut all_atomics: Vec<Atomic> = Vec::new();
        let mut logical_groups: Vec<String> = Vec::new();

        for criterion in criteria {
            let Some(tree) = trees.get(&criterion.criterion_id) else {
                warnings.push(format!("stage12: no expression tree for criterion {}", criterion.criterion_id));
                continue;
            };

            let leaves = tree.leaves();
            let combined_sql = lower_tree(tree, &sql_by_atomic_id, &mut warnings, &criterion.criterion_id);

            let atomics_for_criterion: Vec<Atomic> = leaves
                .iter()
                .filter_map(|leaf| mapped_by_atomic_id.get(leaf.atomic_id.as_str()).map(|m| m.atomic.clone()))
                .collect();

            if atomics_for_criterion.len() != leaves.len() {
                warnings.push(format!(
                    "stage12: atomic count mismatch for {}: {} leaves vs {} resolved atomics (operators involved: {:?})",
                    criterion.criterion_id,
                    leaves.len(),
                    atomics_for_criterion.len(),
                    tree.operator_set()
                ));
            }
            for atomic in &atomics_for_criterion {
                logical_groups.push(atomic.logical_group.clone());
            }
            all_atomics.extend(atomics_for_criterion.iter().cloned());

            let data_sources = self.classify_data_sources(&atomics_for_criterion).await;
            let per_atomic_status: Vec<QebQueryableStatus> = atomics_for_criterion
                .iter()
                .map(|atomic| {
                    let source = data_sources.get(&atomic.atomic_id).copied().unwrap_or(DataSource::ClinicalJudgment);
                    let has_mapping = mapped_by_atomic_id
                        .get(atomic.atomic_id.as_str())
                        .map(|m| m.has_omop_mapping())
                        .unwrap_or(false);
                    QebQueryableStatus::from_data_source(source, has_mapping)
                })
                .collect();
            let queryable_status = QebQueryableStatus::aggregate(&per_atomic_status);

            let (omop_concepts, fhir_resources) = collect_mappings(&atomics_for_criterion, &mapped_by_atomic_id);

            let naming = self.generate_clinical_naming(criterion, &atomics_for_criterion).await;

            let placement = funnel_placement.get(&criterion.criterion_id);

            let mut qeb = Qeb {
                criterion_id: criterion.criterion_id.clone(),
                state: QebState::Raw,
                combined_sql,
                clinical_name: None,
                clinical_description: None,
                clinical_category: None,
                internal_logic: format!("{:?}", tree.operator_set()),
                funnel_stage: None,
                funnel_order: None,
                queryable_status,
                omop_concepts,
                fhir_resources,
                cdisc_concepts: Vec::new(),
                clinical_summary: None,
                atomics: atomics_for_criterion,
            };
            qeb.dedupe_omop_concepts();

            if let Some(naming) = naming {
                qeb.clinical_name = Some(naming.clinical_name);
                qeb.clinical_description = Some(naming.clinical_description);
                qeb.clinical_category = Some(naming.clinical_category);
                qeb.cdisc_concepts = naming.cdisc_concepts.into_iter().map(CdiscBiomedicalConcept::sanitized).collect();
                if !naming.concept_groups.is_empty() {
                    qeb.clinical_summary = Some(ClinicalSummary {
                        concept_groups: naming.concept_groups,
                        plain_english_logic: naming.plain_english_logic,
                    });
                }
            }
            if let Err(e) = qeb.transition(QebState::Named) {
                warnings.push(format!("stage12: {e}"));
            }
            if let Err(e) = qeb.transition(QebState::Assessed) {
                warnings.push(format!("stage12: {e}"));
            }

            if let Some((stage_name, order)) = placement {
                qeb.funnel_stage = Some(stage_name.clone());
                qeb.funnel_order = Some(*order);
            }
            if let Err(e) = qeb.transition(QebState::Staged) {
                warnings.push(format!("stage12: {e}"));
            }
            if let Err(e) = qeb.transition(QebState::Finalized) {
                warnings.push(format!("stage12: {e}"));
            }

            blocks.push(qeb);
        }

        let output = assemble_output(blocks, all_atomics, logical_groups, funnel);
        Ok((output, warnings))
    }

    async fn classify_data_sources(&self, atomics: &[Atomic]) -> HashMap<String, DataSource> {
        if atomics.is_empty() {
            return HashMap::new();
        }
        let prompt = build_data_source_prompt(atomics);
        let raw = match self.gateway.call_llm("stage12_data_source_classification", &prompt, true, 2048, 0.0).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "stage12 data-source classification LLM call failed, defaulting to clinical judgment");
                return HashMap::new();
            }
        };
        parse_data_source_response(&raw)
    }

    async fn generate_clinical_naming(&self, criterion: &RawCriterion, atomics: &[Atomic]) -> Option<ClinicalNaming> {
        if atomics.is_empty() {
            return None;
        }
        let prompt = build_naming_prompt(criterion, atomics);
        match self.gateway.call_llm("stage12_clinical_naming", &prompt, true, 2048, 0.2).await {
            Ok(raw) => parse_naming_response(&raw, &criterion.criterion_id),
            Err(err) => {
                warn!(criterion_id = %criterion.criterion_id, error = %err, "stage12 clinical naming LLM call failed");
                None
            }
        }
    }
}

fn index_sql_atomics(sql_atomics: &[SqlAtomic]) -> HashMap<&str, &SqlAtomic> {
    sql_atomics.iter().map(|s| (s.mapped.atomic.atomic_id.as_str(), s)).collect()
}

fn index_mapped(mapped: &[MappedAtomic]) -> HashMap<&str, &MappedAtomic> {
    mapped.iter().map(|m| (m.atomic.atomic_id.as_str(), m)).collect()
}

/// `(criterionId -> (stageDisplayName, order))` for criteria Stage 11
/// selected as key criteria.
fn index_funnel_placement(funnel: &FunnelResult) -> HashMap<String, (String, u32)> {
    let mut out = HashMap::new();
    for stage in &funnel.stages {
        for key_criterion in &stage.key_criteria {
            for original_id in &key_criterion.original_criterion_ids {
                out.insert(original_id.clone(), (stage.name.clone(), stage.order));
            }
        }
    }
    out
}

/// Resolve a leaf's SQL atomic by id, falling back to a numeric-suffix
/// match (e.g. a leaf `INC_1.A0` against an atomic id differing only in a
/// trailing digit) and finally to a placeholder with a warning.
fn resolve_leaf_sql<'a>(
    atomic_id: &str,
    sql_by_atomic_id: &HashMap<&str, &'a SqlAtomic>,
    warnings: &mut Vec<String>,
    criterion_id: &str,
) -> String {
    if let Some(sql) = sql_by_atomic_id.get(atomic_id) {
        return sql.sql.clone();
    }
    let numeric_suffix = atomic_id.rsplit(|c: char| !c.is_ascii_digit()).next();
    if let Some(suffix) = numeric_suffix {
        if !suffix.is_empty() {
            if let Some((_, sql)) = sql_by_atomic_id.iter().find(|(id, _)| id.ends_with(suffix)) {
                return sql.sql.clone();
            }
        }
    }
    warnings.push(format!("stage12: no SQL atomic resolved for leaf {atomic_id} in criterion {criterion_id}, using placeholder"));
    format!("-- unresolved atomic: {atomic_id}")
}

/// Recursive combined-SQL lowering: atomic -> atomic
/// SQL; AND -> INTERSECT chain; OR -> UNION chain; NOT(a) -> `(all
/// persons) EXCEPT (a)`; EXCEPT(a,b) -> `(a) EXCEPT (b)`;
/// IMPLICATION(c,r) -> `((persons) EXCEPT (c)) UNION ((c) INTERSECT (r))`;
/// TEMPORAL(x) wraps x in a date-range-filtered subquery.
fn lower_tree(
    tree: &ExpressionTree,
    sql_by_atomic_id: &HashMap<&str, &SqlAtomic>,
    warnings: &mut Vec<String>,
    criterion_id: &str,
) -> String {
    const ALL_PERSONS: &str = "SELECT DISTINCT person_id FROM person";

    match tree {
        ExpressionTree::Atomic(leaf) => resolve_leaf_sql(&leaf.atomic_id, sql_by_atomic_id, warnings, criterion_id),
        ExpressionTree::And(children) => {
            let parts: Vec<String> = children
                .iter()
                .map(|c| format!("({})", lower_tree(c, sql_by_atomic_id, warnings, criterion_id)))
                .collect();
            parts.join("\nINTERSECT\n")
        }
        ExpressionTree::Or(children) => {
            let parts: Vec<String> = children
                .iter()
                .map(|c| format!("({})", lower_tree(c, sql_by_atomic_id, warnings, criterion_id)))
                .collect();
            parts.join("\nUNION\n")
        }
        ExpressionTree::Not(child) => {
            let inner = lower_tree(child, sql_by_atomic_id, warnings, criterion_id);
            format!("({ALL_PERSONS})\nEXCEPT\n({inner})")
        }
        ExpressionTree::Except { minuend, subtrahend } => {
            let m = lower_tree(minuend, sql_by_atomic_id, warnings, criterion_id);
            let s = lower_tree(subtrahend, sql_by_atomic_id, warnings, criterion_id);
            format!("({m})\nEXCEPT\n({s})")
        }
        ExpressionTree::Implication { condition, requirement } => {
            let c = lower_tree(condition, sql_by_atomic_id, warnings, criterion_id);
            let r = lower_tree(requirement, sql_by_atomic_id, warnings, criterion_id);
            format!("(({ALL_PERSONS}) EXCEPT ({c}))\nUNION\n(({c}) INTERSECT ({r}))")
        }
        ExpressionTree::Temporal { operand, constraint } => {
            let inner = lower_tree(operand, sql_by_atomic_id, warnings, criterion_id);
            format!(
                "SELECT person_id FROM ({inner}) AS temporal_base \
                 -- {direction:?} {value} {unit} of {reference}",
                direction = constraint.direction,
                value = constraint.duration_value,
                unit = constraint.duration_unit,
                reference = constraint.reference_point,
            )
        }
    }
}

fn collect_mappings(
    atomics: &[Atomic],
    mapped_by_atomic_id: &HashMap<&str, &MappedAtomic>,
) -> (Vec<OmopMapping>, Vec<FhirMapping>) {
    let mut omop = Vec::new();
    let mut fhir = Vec::new();
    for atomic in atomics {
        if let Some(mapped) = mapped_by_atomic_id.get(atomic.atomic_id.as_str()) {
            if let Some(primary) = &mapped.primary_omop {
                omop.push(primary.clone());
            }
            omop.extend(mapped.secondary_omop.iter().cloned());
            fhir.extend(mapped.fhir.iter().cloned());
        }
    }
    (omop, fhir)
}

fn build_data_source_prompt(atomics: &[Atomic]) -> String {
    let entries: Vec<Value> = atomics
        .iter()
        .map(|a| serde_json::json!({"atomic_id": a.atomic_id, "text": a.atomic_text, "domain_hint": a.domain_hint}))
        .collect();
    let atomics_json = serde_json::to_string(&entries).unwrap_or_default();
    format!(
        "For each clinical eligibility atomic statement below, classify where the answering \
         evidence actually lives during trial screening. Choose one of: ehr_structured, \
         pathology_report, radiology_report, clinical_notes, real_time_assessment, \
         clinical_judgment, calculated_value, patient_decision.\n\n\
         Respond as a JSON object keyed by atomic_id, each value {{\"data_source\": string}}.\n\n\
         Atomics:\n{atomics_json}"
    )
}

fn parse_data_source_response(raw: &str) -> HashMap<String, DataSource> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "stage12 data-source response was not valid JSON");
            return HashMap::new();
        }
    };
    let Some(object) = value.as_object() else {
        return HashMap::new();
    };
    object
        .iter()
        .filter_map(|(id, entry)| {
            let raw_source = entry.get("data_source")?.as_str()?;
            Some((id.clone(), parse_data_source(raw_source)))
        })
        .collect()
}

fn parse_data_source(raw: &str) -> DataSource {
    match raw {
        "ehr_structured" => DataSource::EhrStructured,
        "pathology_report" => DataSource::PathologyReport,
        "radiology_report" => DataSource::RadiologyReport,
        "clinical_notes" => DataSource::ClinicalNotes,
        "real_time_assessment" => DataSource::RealTimeAssessment,
        "calculated_value" => DataSource::CalculatedValue,
        "patient_decision" => DataSource::PatientDecision,
        _ => DataSource::ClinicalJudgment,
    }
}

struct ClinicalNaming {
    clinical_name: String,
    clinical_description: String,
    clinical_category: String,
    cdisc_concepts: Vec<CdiscBiomedicalConcept>,
    concept_groups: Vec<ClinicalConceptGroup>,
    plain_english_logic: String,
}

fn build_naming_prompt(criterion: &RawCriterion, atomics: &[Atomic]) -> String {
    let atomic_ids: Vec<&str> = atomics.iter().map(|a| a.atomic_id.as_str()).collect();
    format!(
        "Summarize the following clinical trial eligibility criterion for a feasibility \
         dashboard. Criterion id: {}\nCriterion text: {}\nAtomic ids: {:?}\n\n\
         Respond as a single JSON object: {{\"clinical_name\": string (short label), \
         \"clinical_description\": string (one sentence), \"clinical_category\": string, \
         \"plain_english_logic\": string (explain the AND/OR/NOT structure in plain language), \
         \"cdisc_concepts\": [{{\"concept_name\": string, \"cdisc_code\": string, \"domain\": \
         string, \"rationale\": string, \"confidence\": number}}], \"concept_groups\": \
         [{{\"group_name\": string, \"atomic_ids\": [string], \"screening_only_requirements\": \
         [string]}}]}}",
        criterion.criterion_id, criterion.text, atomic_ids
    )
}

#[derive(Debug, Deserialize)]
struct RawNaming {
    clinical_name: String,
    clinical_description: String,
    clinical_category: String,
    #[serde(default)]
    plain_english_logic: String,
    #[serde(default)]
    cdisc_concepts: Vec<CdiscBiomedicalConcept>,
    #[serde(default)]
    concept_groups: Vec<ClinicalConceptGroup>,
}

fn parse_naming_response(raw: &str, criterion_id: &str) -> Option<ClinicalNaming> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| warn!(criterion_id = %criterion_id, error = %e, "stage12 naming response was not valid JSON"))
        .ok()?;
    let parsed: RawNaming = serde_json::from_value(value)
        .map_err(|e| warn!(criterion_id = %criterion_id, error = %e, "stage12 naming response missing required fields"))
        .ok()?;
    Some(ClinicalNaming {
        clinical_name: parsed.clinical_name,
        clinical_description: parsed.clinical_description,
        clinical_category: parsed.clinical_category,
        cdisc_concepts: parsed.cdisc_concepts,
        concept_groups: parsed.concept_groups,
        plain_english_logic: parsed.plain_english_logic,
    })
}

fn assemble_output(blocks: Vec<Qeb>, all_atomics: Vec<Atomic>, logical_groups: Vec<String>, funnel: &FunnelResult) -> QebOutput {
    let mut summary_counts: HashMap<String, u64> = HashMap::new();
    for block in &blocks {
        let key = format!("{:?}", block.queryable_status);
        *summary_counts.entry(key).or_insert(0) += 1;
    }
    summary_counts.insert("total".to_string(), blocks.len() as u64);

    let mut recommended_order: Vec<String> = blocks.iter().map(|b| b.criterion_id.clone()).collect();
    recommended_order.sort_by_key(|id| {
        blocks
            .iter()
            .find(|b| &b.criterion_id == id)
            .and_then(|b| b.funnel_order)
            .unwrap_or(u32::MAX)
    });

    let manual_review_required: Vec<String> = blocks
        .iter()
        .filter(|b| b.queryable_status == QebQueryableStatus::RequiresManual || b.queryable_status == QebQueryableStatus::ScreeningOnly)
        .map(|b| b.criterion_id.clone())
        .collect();

    let execution_guide = ExecutionGuide {
        recommended_order,
        killer_criteria: funnel.killer_criterion_ids.clone(),
        manual_review_required,
    };

    QebOutput {
        summary_counts,
        funnel_stages: funnel.stages.clone(),
        queryable_blocks: blocks,
        atomic_criteria: all_atomics,
        logical_groups,
        execution_guide,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::expression_tree::AtomicLeaf;
    use crate::domain::funnel::{PopulationEstimate, PopulationEstimateMethod};
    use crate::domain::raw_criterion::CriterionType;
    use crate::domain::sql_atomic::OmopTable;

    fn leaf(id: &str) -> ExpressionTree {
        ExpressionTree::Atomic(AtomicLeaf {
            atomic_id: id.to_string(),
            atomic_text: format!("text-{id}"),
            domain_hint: None,
            time_frame: None,
            numeric_constraint: None,
            clinical_category: None,
            queryability_hint: None,
            clinical_concept_group: None,
        })
    }

    fn sql_atomic(id: &str) -> SqlAtomic {
        SqlAtomic {
            mapped: MappedAtomic::unmapped(Atomic {
                atomic_id: id.to_string(),
                atomic_text: format!("text-{id}"),
                criterion_id: "INC_1".into(),
                criterion_type: CriterionType::Inclusion,
                logical_group: format!("INC_1.{id}"),
                domain_hint: Some("condition".into()),
                clinical_category: None,
                clinical_concept_group: None,
            }),
            table: OmopTable::ConditionOccurrence,
            sql: format!("SELECT DISTINCT person_id FROM condition_occurrence WHERE condition_concept_id = 1 -- {id}"),
            fhir_search: None,
        }
    }

    #[test]
    fn lowers_and_to_intersect() {
        let tree = ExpressionTree::And(vec![leaf("A1"), leaf("A2")]);
        let atomics = vec![sql_atomic("A1"), sql_atomic("A2")];
        let sql_by_id = index_sql_atomics(&atomics);
        let mut warnings = Vec::new();
        let sql = lower_tree(&tree, &sql_by_id, &mut warnings, "INC_1");
        assert!(sql.contains("INTERSECT"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn lowers_not_against_all_persons() {
        let tree = ExpressionTree::Not(Box::new(leaf("A1")));
        let atomics = vec![sql_atomic("A1")];
        let sql_by_id = index_sql_atomics(&atomics);
        let mut warnings = Vec::new();
        let sql = lower_tree(&tree, &sql_by_id, &mut warnings, "INC_1");
        assert!(sql.contains("FROM person"));
        assert!(sql.contains("EXCEPT"));
    }

    #[test]
    fn lowers_implication_to_not_or_form() {
        let tree = ExpressionTree::Implication {
            condition: Box::new(leaf("C")),
            requirement: Box::new(leaf("R")),
        };
        let atomics = vec![sql_atomic("C"), sql_atomic("R")];
        let sql_by_id = index_sql_atomics(&atomics);
        let mut warnings = Vec::new();
        let sql = lower_tree(&tree, &sql_by_id, &mut warnings, "INC_1");
        assert!(sql.contains("EXCEPT"));
        assert!(sql.contains("INTERSECT"));
        assert!(sql.contains("UNION"));
    }

    #[test]
    fn unresolved_leaf_produces_warning_and_placeholder() {
        let tree = leaf("GHOST");
        let sql_by_id = HashMap::new();
        let mut warnings = Vec::new();
        let sql = lower_tree(&tree, &sql_by_id, &mut warnings, "INC_1");
        assert!(sql.contains("unresolved atomic"));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn parse_data_source_handles_known_values() {
        let raw = r#"{"A1": {"data_source": "ehr_structured"}, "A2": {"data_source": "clinical_notes"}}"#;
        let parsed = parse_data_source_response(raw);
        assert_eq!(parsed.get("A1"), Some(&DataSource::EhrStructured));
        assert_eq!(parsed.get("A2"), Some(&DataSource::ClinicalNotes));
    }

    #[test]
    fn assemble_output_counts_total_and_orders_by_funnel() {
        let mut q1 = Qeb {
            criterion_id: "INC_1".into(),
            state: QebState::Finalized,
            combined_sql: "...".into(),
            clinical_name: None,
            clinical_description: None,
            clinical_category: None,
            internal_logic: "[]".into(),
            funnel_stage: Some("Disease Indication".into()),
            funnel_order: Some(0),
            queryable_status: QebQueryableStatus::FullyQueryable,
            omop_concepts: vec![],
            fhir_resources: vec![],
            cdisc_concepts: vec![],
            clinical_summary: None,
            atomics: vec![],
        };
        let q2 = Qeb {
            criterion_id: "EXC_1".into(),
            funnel_order: None,
            ..q1.clone()
        };
        q1.queryable_status = QebQueryableStatus::RequiresManual;
        let funnel = FunnelResult {
            stages: vec![],
            killer_criterion_ids: vec![],
            optimization_opportunities: vec![],
            site_rankings: vec![],
            population_estimate: PopulationEstimate::new(100, PopulationEstimateMethod::Query),
        };
        let output = assemble_output(vec![q1, q2], vec![], vec![], &funnel);
        assert_eq!(output.summary_counts.get("total"), Some(&2));
        assert_eq!(output.execution_guide.recommended_order[0], "INC_1");
        assert!(output.execution_guide.manual_review_required.contains(&"INC_1".to_string()));
    }
}
