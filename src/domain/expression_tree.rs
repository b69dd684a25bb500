//! `ExpressionTree`: the rooted boolean/temporal lowering of one criterion
//! produced by Stage 2.
//!
//! Dynamic-typing-to-tagged-variants: the arity irregularity of
//! the source representation - `NOT` unary, `IMPLICATION` with named
//! children `condition`/`requirement` - is encoded as distinct variant
//! shapes rather than a single `Operator` node with a generic operand list.

use serde::{Deserialize, Serialize};

/// A leaf of the expression tree: a SQL-queryable atomic statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicLeaf {
    pub atomic_id: String,
    pub atomic_text: String,
    pub domain_hint: Option<String>,
    pub time_frame: Option<String>,
    pub numeric_constraint: Option<NumericConstraint>,
    pub clinical_category: Option<String>,
    pub queryability_hint: Option<String>,
    pub clinical_concept_group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
    Ne,
}

impl ComparisonOperator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericConstraint {
    pub operator: ComparisonOperator,
    pub threshold: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TemporalDirection {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalConstraint {
    pub reference_point: String,
    pub direction: TemporalDirection,
    pub duration_value: u32,
    pub duration_unit: String,
}

/// A closed enumeration of the operator families, used where the specific
/// tree shape is not needed - e.g. Stage 12's reconciliation warnings list
/// "the operator set involved" when leaf counts don't match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    And,
    Or,
    Not,
    Except,
    Implication,
    Temporal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node")]
pub enum ExpressionTree {
    Atomic(AtomicLeaf),
    And(Vec<ExpressionTree>),
    Or(Vec<ExpressionTree>),
    Not(Box<ExpressionTree>),
    Except {
        minuend: Box<ExpressionTree>,
        subtrahend: Box<ExpressionTree>,
    },
    Implication {
        condition: Box<ExpressionTree>,
        requirement: Box<ExpressionTree>,
    },
    Temporal {
        operand: Box<ExpressionTree>,
        constraint: TemporalConstraint,
    },
}

impl ExpressionTree {
    pub fn operator(&self) -> Option<Operator> {
        match self {
            Self::Atomic(_) => None,
            Self::And(_) => Some(Operator::And),
            Self::Or(_) => Some(Operator::Or),
            Self::Not(_) => Some(Operator::Not),
            Self::Except { .. } => Some(Operator::Except),
            Self::Implication { .. } => Some(Operator::Implication),
            Self::Temporal { .. } => Some(Operator::Temporal),
        }
    }

    /// Collect every atomic leaf in traversal order.
    pub fn leaves(&self) -> Vec<&AtomicLeaf> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a AtomicLeaf>) {
        match self {
            Self::Atomic(leaf) => out.push(leaf),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
            Self::Not(child) => child.collect_leaves(out),
            Self::Except { minuend, subtrahend } => {
                minuend.collect_leaves(out);
                subtrahend.collect_leaves(out);
            }
            Self::Implication { condition, requirement } => {
                condition.collect_leaves(out);
                requirement.collect_leaves(out);
            }
            Self::Temporal { operand, .. } => operand.collect_leaves(out),
        }
    }

    /// Collect the distinct set of operator kinds appearing anywhere in the
    /// tree, used to diagnose atomic-count mismatches at Stage 12.
    pub fn operator_set(&self) -> Vec<Operator> {
        let mut seen = Vec::new();
        self.collect_operators(&mut seen);
        seen
    }

    fn collect_operators(&self, seen: &mut Vec<Operator>) {
        if let Some(op) = self.operator() {
            if !seen.contains(&op) {
                seen.push(op);
            }
        }
        match self {
            Self::Atomic(_) => {}
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_operators(seen);
                }
            }
            Self::Not(child) => child.collect_operators(seen),
            Self::Except { minuend, subtrahend } => {
                minuend.collect_operators(seen);
                subtrahend.collect_operators(seen);
            }
            Self::Implication { condition, requirement } => {
                condition.collect_operators(seen);
                requirement.collect_operators(seen);
            }
            Self::Temporal { operand, .. } => operand.collect_operators(seen),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn leaves_counted_through_and_or() {
        let tree = ExpressionTree::Or(vec![leaf("A"), leaf("B")]);
        assert_eq!(tree.leaves().len(), 2);
    }

    #[test]
    fn not_is_unary() {
        let tree = ExpressionTree::Not(Box::new(leaf("A")));
        assert_eq!(tree.leaves().len(), 1);
        assert_eq!(tree.operator(), Some(Operator::Not));
    }

    #[test]
    fn except_is_binary_set_difference() {
        let tree = ExpressionTree::Except {
            minuend: Box::new(leaf("A")),
            subtrahend: Box::new(leaf("B")),
        };
        assert_eq!(tree.leaves().len(), 2);
    }

    #[test]
    fn implication_has_named_children() {
        let tree = ExpressionTree::Implication {
            condition: Box::new(leaf("C")),
            requirement: Box::new(leaf("R")),
        };
        let leaves: Vec<_> = tree.leaves().iter().map(|l| l.atomic_id.clone()).collect();
        assert_eq!(leaves, vec!["C", "R"]);
    }

    #[test]
    fn temporal_wraps_exactly_one_operand() {
        let tree = ExpressionTree::Temporal {
            operand: Box::new(leaf("A")),
            constraint: TemporalConstraint {
                reference_point: "enrollment".into(),
                direction: TemporalDirection::Before,
                duration_value: 6,
                duration_unit: "months".into(),
            },
        };
        assert_eq!(tree.leaves().len(), 1);
    }

    #[test]
    fn operator_set_reports_distinct_operators_for_nested_tree() {
        let tree = ExpressionTree::Not(Box::new(ExpressionTree::Temporal {
            operand: Box::new(leaf("A")),
            constraint: TemporalConstraint {
                reference_point: "enrollment".into(),
                direction: TemporalDirection::Before,
                duration_value: 6,
                duration_unit: "months".into(),
            },
        }));
        let ops = tree.operator_set();
        assert!(ops.contains(&Operator::Not));
        assert!(ops.contains(&Operator::Temporal));
        assert_eq!(ops.len(), 2);
    }
}
