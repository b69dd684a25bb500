//! `Atomic`: the flat view of an expression-tree leaf with its execution
//! context.

use crate::domain::expression_tree::AtomicLeaf;
use crate::domain::raw_criterion::CriterionType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atomic {
    pub atomic_id: String,
    pub atomic_text: String,
    pub criterion_id: String,
    pub criterion_type: CriterionType,
    /// Identifier encoding the leaf's position in its parent criterion,
    /// e.g. `INC_2.OR.0`.
    pub logical_group: String,
    pub domain_hint: Option<String>,
    pub clinical_category: Option<String>,
    pub clinical_concept_group: Option<String>,
}

impl Atomic {
    pub fn from_leaf(
        leaf: &AtomicLeaf,
        criterion_id: &str,
        criterion_type: CriterionType,
        logical_group: String,
    ) -> Self {
        Self {
            atomic_id: leaf.atomic_id.clone(),
            atomic_text: leaf.atomic_text.clone(),
            criterion_id: criterion_id.to_string(),
            criterion_type,
            logical_group,
            domain_hint: leaf.domain_hint.clone(),
            clinical_category: leaf.clinical_category.clone(),
            clinical_concept_group: leaf.clinical_concept_group.clone(),
        }
    }
}
