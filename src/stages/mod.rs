//! The pipeline's twelve ordered stages, plus the two
//! Schedule-of-Activities side modules that the orchestrator
//! runs alongside Stage 7's USDM compliance pass.

pub mod alternative_resolution;
pub mod cycle_expansion;
pub mod stage2_decomposition;
pub mod stage4_mapping;
pub mod stage6_sql;
pub mod stage7_usdm_compliance;
pub mod stage11_feasibility;
pub mod stage12_qeb_builder;

pub use alternative_resolution::AlternativeResolution;
pub use cycle_expansion::CycleExpansion;
pub use stage2_decomposition::{DecomposedCriterion, Stage2Decomposition};
pub use stage4_mapping::{Stage4Mapping, VocabularySearch};
pub use stage6_sql::Stage6Sql;
pub use stage7_usdm_compliance::{ComplianceResult, Stage7Compliance};
pub use stage11_feasibility::Stage11Feasibility;
pub use stage12_qeb_builder::Stage12QebBuilder;
