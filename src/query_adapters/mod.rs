//! Query Adapter capability set: a uniform trait
//! for patient-population queries against either a real data source or
//! the bundled synthetic estimator, grounded in the original's
//! `BaseDataAdapter`/`QueryResult` shape.

pub mod fhir;
pub mod omop;
pub mod synthetic;

pub use fhir::FhirAdapter;
pub use omop::OmopAdapter;
pub use synthetic::SyntheticAdapter;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

/// Result of a single patient-population query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub patient_count: u64,
    pub query_executed: String,
    pub execution_time_ms: f64,
    pub metadata: HashMap<String, String>,
}

impl QueryResult {
    pub fn new(patient_count: u64, query_executed: impl Into<String>) -> Self {
        Self {
            patient_count,
            query_executed: query_executed.into(),
            execution_time_ms: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
}

/// Capability set every adapter implements: connect/disconnect,
/// total population, and per-OMOP-domain query methods. `execute_sql` is
/// optional - only an adapter with live SQL access implements it.
#[async_trait]
pub trait QueryAdapter: Send + Sync {
    async fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    async fn get_total_population(&self) -> Result<u64>;

    async fn query_condition(&self, concept_ids: &[i64], include_descendants: bool) -> Result<QueryResult>;

    async fn query_measurement(
        &self,
        concept_ids: &[i64],
        value_operator: ComparisonOperator,
        value_threshold: f64,
    ) -> Result<QueryResult>;

    async fn query_drug_exposure(&self, concept_ids: &[i64], include_descendants: bool) -> Result<QueryResult>;

    async fn query_procedure(&self, concept_ids: &[i64], include_descendants: bool) -> Result<QueryResult>;

    async fn query_observation(&self, concept_ids: &[i64]) -> Result<QueryResult>;

    async fn query_demographics(&self, min_age: Option<u32>, max_age: Option<u32>) -> Result<QueryResult>;

    /// Only implemented by adapters with direct SQL access;
    /// defaults to [`Error::DataAvailability`].
    async fn execute_sql(&self, _sql: &str) -> Result<QueryResult> {
        Err(crate::error::Error::DataAvailability(
            "this adapter does not support direct SQL execution".to_string(),
        ))
    }
}
