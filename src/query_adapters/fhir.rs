//! FHIR R4 query adapter: stubbed, matching the original's
//! incomplete `data_adapters/fhir_adapter.py`. A live implementation would
//! issue `$everything`/`Patient` search queries against a FHIR REST
//! endpoint; wiring that endpoint in is out of scope here, so every
//! operation surfaces [`Error::DataAvailability`] rather than silently
//! returning a wrong count.

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{ComparisonOperator, QueryAdapter, QueryResult};

pub struct FhirAdapter {
    base_url: String,
    connected: bool,
}

impl FhirAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connected: false,
        }
    }

    fn unavailable(&self) -> Error {
        Error::DataAvailability(format!("FHIR querying against {} is not yet implemented", self.base_url))
    }
}

#[async_trait]
impl QueryAdapter for FhirAdapter {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn get_total_population(&self) -> Result<u64> {
        Err(self.unavailable())
    }

    async fn query_condition(&self, _concept_ids: &[i64], _include_descendants: bool) -> Result<QueryResult> {
        Err(self.unavailable())
    }

    async fn query_measurement(
        &self,
        _concept_ids: &[i64],
        _value_operator: ComparisonOperator,
        _value_threshold: f64,
    ) -> Result<QueryResult> {
        Err(self.unavailable())
    }

    async fn query_drug_exposure(&self, _concept_ids: &[i64], _include_descendants: bool) -> Result<QueryResult> {
        Err(self.unavailable())
    }

    async fn query_procedure(&self, _concept_ids: &[i64], _include_descendants: bool) -> Result<QueryResult> {
        Err(self.unavailable())
    }

    async fn query_observation(&self, _concept_ids: &[i64]) -> Result<QueryResult> {
        Err(self.unavailable())
    }

    async fn query_demographics(&self, _min_age: Option<u32>, _max_age: Option<u32>) -> Result<QueryResult> {
        Err(self.unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_query_reports_data_unavailable() {
        let mut adapter = FhirAdapter::new("https://fhir.example.org");
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());
        let result = adapter.get_total_population().await;
        assert!(matches!(result, Err(Error::DataAvailability(_))));
    }
}
