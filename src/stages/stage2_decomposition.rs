//! Stage 2 — Atomic Decomposition: turns each `RawCriterion`
//! into an `ExpressionTree` plus the flat `Atomic` list downstream stages
//! consume. A critical stage: the orchestrator aborts on outright failure,
//! but a per-criterion LLM miss only degrades to a single-leaf tree.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::domain::atomic::Atomic;
use crate::domain::expression_tree::{
    AtomicLeaf, ComparisonOperator, ExpressionTree, NumericConstraint, TemporalConstraint, TemporalDirection,
};
use crate::domain::raw_criterion::RawCriterion;
use crate::error::Result;
use crate::gateway::LlmGateway;

/// Per-criterion decomposition result plus any reconciliation warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposedCriterion {
    pub criterion_id: String,
    pub tree: ExpressionTree,
    pub atomics: Vec<Atomic>,
    pub warnings: Vec<String>,
}

pub struct Stage2Decomposition {
    gateway: Arc<LlmGateway>,
}

impl Stage2Decomposition {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    #[instrument(skip(self, criteria), fields(criterion_count = criteria.len()))]
    pub async fn run(&self, criteria: &[RawCriterion]) -> Result<Vec<DecomposedCriterion>> {
        let mut out = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            out.push(self.decompose_one(criterion).await);
        }
        Ok(out)
    }

    async fn decompose_one(&self, criterion: &RawCriterion) -> DecomposedCriterion {
        let prompt = build_prompt(criterion);
        let tree = match self.gateway.call_llm("stage2_atomic_decomposition", &prompt, true, 2048, 0.0).await {
            Ok(raw) => match parse_tree_response(&raw, &criterion.criterion_id) {
                Some(tree) => tree,
                None => {
                    warn!(criterion_id = %criterion.criterion_id, "stage2 LLM response unparsable, using single-leaf fallback");
                    single_leaf_fallback(criterion)
                }
            },
            Err(err) => {
                warn!(criterion_id = %criterion.criterion_id, error = %err, "stage2 LLM call failed, using single-leaf fallback");
                single_leaf_fallback(criterion)
            }
        };

        let mut atomics = Vec::new();
        assign_logical_groups(&tree, &criterion.criterion_id, criterion.criterion_type, "0", &mut atomics);

        let mut warnings = Vec::new();
        let leaf_count = tree.leaves().len();
        if leaf_count != atomics.len() {
            warnings.push(format!(
                "atomic count mismatch for {}: {} leaves vs {} atomics (operators involved: {:?})",
                criterion.criterion_id,
                leaf_count,
                atomics.len(),
                tree.operator_set()
            ));
        }

        DecomposedCriterion {
            criterion_id: criterion.criterion_id.clone(),
            tree,
            atomics,
            warnings,
        }
    }
}

fn single_leaf_fallback(criterion: &RawCriterion) -> ExpressionTree {
    ExpressionTree::Atomic(AtomicLeaf {
        atomic_id: format!("{}.A0", criterion.criterion_id),
        atomic_text: criterion.text.clone(),
        domain_hint: None,
        time_frame: None,
        numeric_constraint: None,
        clinical_category: None,
        queryability_hint: None,
        clinical_concept_group: None,
    })
}

/// Walk the tree assigning each leaf a `logicalGroup` that encodes its
/// position (e.g. `INC_2.OR.0`), and append the corresponding flat
/// `Atomic` in traversal order.
fn assign_logical_groups(
    tree: &ExpressionTree,
    criterion_id: &str,
    criterion_type: crate::domain::raw_criterion::CriterionType,
    path: &str,
    out: &mut Vec<Atomic>,
) {
    match tree {
        ExpressionTree::Atomic(leaf) => {
            out.push(Atomic::from_leaf(leaf, criterion_id, criterion_type, format!("{criterion_id}.{path}")));
        }
        ExpressionTree::And(children) => {
            for (i, child) in children.iter().enumerate() {
                assign_logical_groups(child, criterion_id, criterion_type, &format!("{path}.AND.{i}"), out);
            }
        }
        ExpressionTree::Or(children) => {
            for (i, child) in children.iter().enumerate() {
                assign_logical_groups(child, criterion_id, criterion_type, &format!("{path}.OR.{i}"), out);
            }
        }
        ExpressionTree::Not(child) => {
            assign_logical_groups(child, criterion_id, criterion_type, &format!("{path}.NOT"), out);
        }
        ExpressionTree::Except { minuend, subtrahend } => {
            assign_logical_groups(minuend, criterion_id, criterion_type, &format!("{path}.EXCEPT.minuend"), out);
            assign_logical_groups(subtrahend, criterion_id, criterion_type, &format!("{path}.EXCEPT.subtrahend"), out);
        }
        ExpressionTree::Implication { condition, requirement } => {
            assign_logical_groups(condition, criterion_id, criterion_type, &format!("{path}.IMPLICATION.condition"), out);
            assign_logical_groups(requirement, criterion_id, criterion_type, &format!("{path}.IMPLICATION.requirement"), out);
        }
        ExpressionTree::Temporal { operand, .. } => {
            assign_logical_groups(operand, criterion_id, criterion_type, &format!("{path}.TEMPORAL"), out);
        }
    }
}

fn build_prompt(criterion: &RawCriterion) -> String {
    format!(
        "Decompose the following clinical trial eligibility criterion into a boolean/temporal \
         expression tree. Node types: atomic leaf {{\"node\":\"Atomic\",\"atomic_id\":string,\"atomic_text\":string,\
         \"domain_hint\":string?,\"numeric_constraint\":{{\"operator\":\"Ge\"|\"Le\"|\"Eq\"|\"Gt\"|\"Lt\"|\"Ne\",\
         \"threshold\":number,\"unit\":string?}}?}}; {{\"node\":\"And\",\"children\":[...]}}; \
         {{\"node\":\"Or\",\"children\":[...]}}; {{\"node\":\"Not\",\"child\":...}} (unary); \
         {{\"node\":\"Except\",\"minuend\":...,\"subtrahend\":...}}; \
         {{\"node\":\"Implication\",\"condition\":...,\"requirement\":...}}; \
         {{\"node\":\"Temporal\",\"operand\":...,\"reference_point\":string,\"direction\":\"Before\"|\"After\",\
         \"duration_value\":integer,\"duration_unit\":string}}.\n\n\
         Criterion id: {}\nCriterion type: {:?}\nText: {}\n\n\
         Respond with a single JSON object for the root node.",
        criterion.criterion_id, criterion.criterion_type, criterion.text
    )
}

#[derive(Debug, Deserialize)]
#[serde(tag = "node")]
enum RawNode {
    Atomic {
        atomic_id: String,
        atomic_text: String,
        #[serde(default)]
        domain_hint: Option<String>,
        #[serde(default)]
        time_frame: Option<String>,
        #[serde(default)]
        numeric_constraint: Option<RawNumericConstraint>,
        #[serde(default)]
        clinical_category: Option<String>,
        #[serde(default)]
        queryability_hint: Option<String>,
        #[serde(default)]
        clinical_concept_group: Option<String>,
    },
    And {
        children: Vec<RawNode>,
    },
    Or {
        children: Vec<RawNode>,
    },
    Not {
        child: Box<RawNode>,
    },
    Except {
        minuend: Box<RawNode>,
        subtrahend: Box<RawNode>,
    },
    Implication {
        condition: Box<RawNode>,
        requirement: Box<RawNode>,
    },
    Temporal {
        operand: Box<RawNode>,
        reference_point: String,
        direction: RawDirection,
        duration_value: u32,
        duration_unit: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawNumericConstraint {
    operator: RawComparisonOperator,
    threshold: f64,
    #[serde(default)]
    unit: Option<String>,
}

#[derive(Debug, Deserialize)]
enum RawComparisonOperator {
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
    Ne,
}

#[derive(Debug, Deserialize)]
enum RawDirection {
    Before,
    After,
}

impl From<RawNode> for ExpressionTree {
    fn from(node: RawNode) -> Self {
        match node {
            RawNode::Atomic {
                atomic_id,
                atomic_text,
                domain_hint,
                time_frame,
                numeric_constraint,
                clinical_category,
                queryability_hint,
                clinical_concept_group,
            } => ExpressionTree::Atomic(AtomicLeaf {
                atomic_id,
                atomic_text,
                domain_hint,
                time_frame,
                numeric_constraint: numeric_constraint.map(|nc| NumericConstraint {
                    operator: match nc.operator {
                        RawComparisonOperator::Ge => ComparisonOperator::Ge,
                        RawComparisonOperator::Le => ComparisonOperator::Le,
                        RawComparisonOperator::Eq => ComparisonOperator::Eq,
                        RawComparisonOperator::Gt => ComparisonOperator::Gt,
                        RawComparisonOperator::Lt => ComparisonOperator::Lt,
                        RawComparisonOperator::Ne => ComparisonOperator::Ne,
                    },
                    threshold: nc.threshold,
                    unit: nc.unit,
                }),
                clinical_category,
                queryability_hint,
                clinical_concept_group,
            }),
            RawNode::And { children } => ExpressionTree::And(children.into_iter().map(Into::into).collect()),
            RawNode::Or { children } => ExpressionTree::Or(children.into_iter().map(Into::into).collect()),
            RawNode::Not { child } => ExpressionTree::Not(Box::new((*child).into())),
            RawNode::Except { minuend, subtrahend } => ExpressionTree::Except {
                minuend: Box::new((*minuend).into()),
                subtrahend: Box::new((*subtrahend).into()),
            },
            RawNode::Implication { condition, requirement } => ExpressionTree::Implication {
                condition: Box::new((*condition).into()),
                requirement: Box::new((*requirement).into()),
            },
            RawNode::Temporal {
                operand,
                reference_point,
                direction,
                duration_value,
                duration_unit,
            } => ExpressionTree::Temporal {
                operand: Box::new((*operand).into()),
                constraint: TemporalConstraint {
                    reference_point,
                    direction: match direction {
                        RawDirection::Before => TemporalDirection::Before,
                        RawDirection::After => TemporalDirection::After,
                    },
                    duration_value,
                    duration_unit,
                },
            },
        }
    }
}

fn parse_tree_response(raw: &str, criterion_id: &str) -> Option<ExpressionTree> {
    let value: Value = serde_json::from_str(raw).ok()?;
    match serde_json::from_value::<RawNode>(value) {
        Ok(node) => Some(node.into()),
        Err(err) => {
            warn!(criterion_id = %criterion_id, error = %err, "stage2 tree shape rejected");
            None
        }
    }
}
