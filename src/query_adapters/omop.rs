//! OMOP CDM query adapter: runs patient-count queries
//! against a SQLite-backed OMOP instance (the bundled Athena vocabulary
//! export's sibling CDM database, `ATHENA_DB_PATH`). Grounded in the
//! original's `data_adapters/omop_adapter.py`, minus its
//! PostgreSQL/SQL-Server drivers - the reimplementation targets the
//! SQLite CDM snapshot the rest of this pipeline already ships with.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;

use crate::domain::sql_atomic::OmopTable;
use crate::error::{Error, Result};

use super::{ComparisonOperator, QueryAdapter, QueryResult};

pub struct OmopAdapter {
    db_path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl OmopAdapter {
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    async fn count_query(&self, sql: String) -> Result<u64> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("omop connection mutex poisoned");
            let connection = guard
                .as_ref()
                .ok_or_else(|| Error::DataAvailability("OMOP adapter not connected".to_string()))?;
            connection
                .query_row(&sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as u64)
                .map_err(|e| Error::DataAvailability(format!("OMOP query failed: {e}")))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    fn concept_in_list(concept_ids: &[i64]) -> String {
        concept_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
    }
}

#[async_trait]
impl QueryAdapter for OmopAdapter {
    async fn connect(&mut self) -> Result<()> {
        let path = self.db_path.clone();
        let connection = tokio::task::spawn_blocking(move || Connection::open(path))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .map_err(|e| Error::DataAvailability(format!("failed to open OMOP database: {e}")))?;
        *self.conn.lock().expect("omop connection mutex poisoned") = Some(connection);
        Ok(())
    }

    fn disconnect(&mut self) {
        *self.conn.lock().expect("omop connection mutex poisoned") = None;
    }

    fn is_connected(&self) -> bool {
        self.conn.lock().expect("omop connection mutex poisoned").is_some()
    }

    async fn get_total_population(&self) -> Result<u64> {
        self.count_query("SELECT COUNT(DISTINCT person_id) FROM person".to_string()).await
    }

    async fn query_condition(&self, concept_ids: &[i64], _include_descendants: bool) -> Result<QueryResult> {
        if concept_ids.is_empty() {
            return Ok(QueryResult::new(0, "no concept ids provided"));
        }
        let table = OmopTable::ConditionOccurrence;
        let sql = format!(
            "SELECT COUNT(DISTINCT person_id) FROM {} WHERE {} IN ({})",
            table.table_name(),
            table.concept_id_column(),
            Self::concept_in_list(concept_ids)
        );
        let count = self.count_query(sql.clone()).await?;
        Ok(QueryResult::new(count, sql))
    }

    async fn query_measurement(
        &self,
        concept_ids: &[i64],
        value_operator: ComparisonOperator,
        value_threshold: f64,
    ) -> Result<QueryResult> {
        if concept_ids.is_empty() {
            return Ok(QueryResult::new(0, "no concept ids provided"));
        }
        let table = OmopTable::Measurement;
        let op = match value_operator {
            ComparisonOperator::Ge => ">=",
            ComparisonOperator::Le => "<=",
            ComparisonOperator::Eq => "=",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Lt => "<",
        };
        let sql = format!(
            "SELECT COUNT(DISTINCT person_id) FROM {} WHERE {} IN ({}) AND value_as_number {} {}",
            table.table_name(),
            table.concept_id_column(),
            Self::concept_in_list(concept_ids),
            op,
            value_threshold
        );
        let count = self.count_query(sql.clone()).await?;
        Ok(QueryResult::new(count, sql))
    }

    async fn query_drug_exposure(&self, concept_ids: &[i64], _include_descendants: bool) -> Result<QueryResult> {
        if concept_ids.is_empty() {
            return Ok(QueryResult::new(0, "no concept ids provided"));
        }
        let table = OmopTable::DrugExposure;
        let sql = format!(
            "SELECT COUNT(DISTINCT person_id) FROM {} WHERE {} IN ({})",
            table.table_name(),
            table.concept_id_column(),
            Self::concept_in_list(concept_ids)
        );
        let count = self.count_query(sql.clone()).await?;
        Ok(QueryResult::new(count, sql))
    }

    async fn query_procedure(&self, concept_ids: &[i64], _include_descendants: bool) -> Result<QueryResult> {
        if concept_ids.is_empty() {
            return Ok(QueryResult::new(0, "no concept ids provided"));
        }
        let table = OmopTable::ProcedureOccurrence;
        let sql = format!(
            "SELECT COUNT(DISTINCT person_id) FROM {} WHERE {} IN ({})",
            table.table_name(),
            table.concept_id_column(),
            Self::concept_in_list(concept_ids)
        );
        let count = self.count_query(sql.clone()).await?;
        Ok(QueryResult::new(count, sql))
    }

    async fn query_observation(&self, concept_ids: &[i64]) -> Result<QueryResult> {
        if concept_ids.is_empty() {
            return Ok(QueryResult::new(0, "no concept ids provided"));
        }
        let table = OmopTable::Observation;
        let sql = format!(
            "SELECT COUNT(DISTINCT person_id) FROM {} WHERE {} IN ({})",
            table.table_name(),
            table.concept_id_column(),
            Self::concept_in_list(concept_ids)
        );
        let count = self.count_query(sql.clone()).await?;
        Ok(QueryResult::new(count, sql))
    }

    async fn query_demographics(&self, min_age: Option<u32>, max_age: Option<u32>) -> Result<QueryResult> {
        let mut sql = "SELECT COUNT(DISTINCT person_id) FROM person WHERE 1=1".to_string();
        if let Some(min_age) = min_age {
            sql.push_str(&format!(" AND (strftime('%Y','now') - year_of_birth) >= {min_age}"));
        }
        if let Some(max_age) = max_age {
            sql.push_str(&format!(" AND (strftime('%Y','now') - year_of_birth) <= {max_age}"));
        }
        let count = self.count_query(sql.clone()).await?;
        Ok(QueryResult::new(count, sql))
    }

    async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let count = self.count_query(sql.to_string()).await?;
        Ok(QueryResult::new(count, sql.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconnected_adapter_reports_data_unavailable() {
        let adapter = OmopAdapter::new(PathBuf::from("/nonexistent.db"));
        assert!(!adapter.is_connected());
        let result = adapter.get_total_population().await;
        assert!(matches!(result, Err(Error::DataAvailability(_))));
    }

    #[tokio::test]
    async fn empty_concept_list_is_zero_without_querying() {
        let adapter = OmopAdapter::new(PathBuf::from("/nonexistent.db"));
        let result = adapter.query_condition(&[], true).await.unwrap();
        assert_eq!(result.patient_count, 0);
    }
}
