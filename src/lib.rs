//! # trial-interpreter
//!
//! Turns a trial's eligibility criteria and schedule of activities into a
//! structured USDM study model plus a queryable eligibility feasibility
//! model: atomic decomposition, OMOP/FHIR concept mapping, SQL-queryable
//! atomics, a sequential population funnel, and deployable Queryable
//! Eligibility Blocks.
//!
//! ## Core components
//!
//! - **domain**: the data model flowing through every stage (raw criteria,
//!   expression trees, mappings, SQL atomics, funnel, QEBs, USDM document).
//! - **gateway**: the single LLM access point every stage calls through.
//! - **reflection**: bounded generate-validate-correct passes shared by
//!   several stages.
//! - **cache**: the three on-disk caches backing the gateway and concept
//!   expansion.
//! - **stages**: the pipeline's twelve ordered stages.
//! - **orchestrator**: runs the stages in dependency order and persists
//!   per-stage artifacts for resumption.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trial_interpreter::orchestrator::{PipelineOrchestrator, CancellationToken, TracingProgressSink};
//! use trial_interpreter::config::PipelineConfig;
//! use std::sync::Arc;
//!
//! # async fn run() -> trial_interpreter::error::Result<()> {
//! let config = PipelineConfig::from_env()?;
//! let orchestrator = PipelineOrchestrator::new(config, Arc::new(TracingProgressSink), CancellationToken::new())?;
//! let result = orchestrator.run(std::path::Path::new("eligibility_criteria.json"), "NCT00000000", 1_000_000).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clinical_reasoner;
pub mod concept_expansion;
pub mod config;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod orchestrator;
pub mod population_estimator;
pub mod query_adapters;
pub mod reference_data;
pub mod reflection;
pub mod stages;
pub mod validation;
pub mod validators;

pub use cache::CacheRegistry;
pub use config::PipelineConfig;
pub use domain::{
    Atomic, ConceptExpansion, CriterionType, ExpressionTree, FhirMapping, FunnelResult, FunnelStage,
    KeyCriterion, KeyCriterionCategory, MappedAtomic, OmopMapping, Operator, PopulationEstimate,
    PopulationEstimateMethod, Provenance, Qeb, QebOutput, QebState, QueryableStatus, RawCriterion,
    SqlAtomic, TemporalConstraint,
};
pub use error::{Error, Result};
pub use gateway::LlmGateway;
pub use orchestrator::{
    load_eligibility_criteria, CancellationToken, PipelineOrchestrator, PipelineRunResult, ProgressSink,
    StageProgress, TracingProgressSink,
};
pub use reference_data::ReferenceDataManager;
