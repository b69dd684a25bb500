//! Shared domain types flowing through the interpretation pipeline.
//!
//! Dependency order (leaves first): raw criteria, expression trees and flat
//! atomics, concept expansions, OMOP/FHIR mappings, SQL atomics, key
//! criteria, funnel stages/results, queryable eligibility blocks, and the
//! USDM document model.

pub mod atomic;
pub mod concept;
pub mod expression_tree;
pub mod funnel;
pub mod key_criterion;
pub mod mapping;
pub mod qeb;
pub mod raw_criterion;
pub mod sql_atomic;
pub mod usdm;

pub use atomic::Atomic;
pub use concept::ConceptExpansion;
pub use expression_tree::{ExpressionTree, Operator, TemporalConstraint};
pub use funnel::{FunnelResult, FunnelStage, PopulationEstimate, PopulationEstimateMethod};
pub use key_criterion::{KeyCriterion, KeyCriterionCategory, QueryableStatus};
pub use mapping::{FhirMapping, MappedAtomic, OmopMapping};
pub use qeb::{Qeb, QebOutput, QebState};
pub use raw_criterion::{CriterionType, Provenance, RawCriterion};
pub use sql_atomic::SqlAtomic;
