//! Validation of compiled rule queries against live data.

use crate::error::{DqError, Result};
use crate::safety::QueryGuard;
use crate::schema::{quote_ident, SchemaResolver};
use crate::store::DataStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Match statistics for one rule query.
///
/// `percentage_bad_rows` is `None` when the checked column has no
/// countable values, since no percentage is meaningful then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_rows: u64,
    pub total_good_rows: u64,
    pub percentage_bad_rows: Option<f64>,
    pub good_row_numbers: Vec<i64>,
}

pub struct QueryValidator {
    store: Arc<dyn DataStore>,
    resolver: SchemaResolver,
    guard: QueryGuard,
    execution_timeout: Duration,
}

impl QueryValidator {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self::with_timeout(store, Duration::from_secs(30))
    }

    pub fn with_timeout(store: Arc<dyn DataStore>, execution_timeout: Duration) -> Self {
        let resolver = SchemaResolver::new(store.clone());
        Self {
            store,
            resolver,
            guard: QueryGuard::new(),
            execution_timeout,
        }
    }

    /// Run a compiled rule query and compute its match statistics.
    ///
    /// The query must produce a single numeric row-number column (the
    /// rows satisfying the rule). Execution failures here are hard
    /// errors; there is no model in the loop to repair anything.
    pub async fn validate(
        &self,
        query: &str,
        table_name: &str,
        column_name: &str,
    ) -> Result<ValidationReport> {
        self.resolver.assert_column(table_name, column_name).await?;
        self.guard.check(query)?;

        let rows = self.execute(query).await?;
        if rows.columns.len() != 1 {
            return Err(DqError::QueryExecution(format!(
                "rule query must return a single row_num column, got {} columns",
                rows.columns.len()
            )));
        }

        let mut good_row_numbers = Vec::with_capacity(rows.rows.len());
        for row in &rows.rows {
            let number = row
                .first()
                .and_then(|cell| cell.as_i64())
                .ok_or_else(|| {
                    DqError::QueryExecution("rule query returned a non-numeric row_num".to_string())
                })?;
            good_row_numbers.push(number);
        }

        let count_query = format!(
            "SELECT COUNT({}) FROM {}",
            quote_ident(column_name),
            quote_ident(table_name)
        );
        let count_rows = self.execute(&count_query).await?;
        let total_rows = count_rows
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|cell| cell.as_i64())
            .unwrap_or(0)
            .max(0) as u64;

        let total_good_rows = good_row_numbers.len() as u64;
        let percentage_bad_rows = if total_rows == 0 {
            None
        } else {
            Some(100.0 - (total_good_rows as f64 * 100.0 / total_rows as f64))
        };

        Ok(ValidationReport {
            total_rows,
            total_good_rows,
            percentage_bad_rows,
            good_row_numbers,
        })
    }

    async fn execute(&self, query: &str) -> Result<crate::store::QueryRows> {
        match timeout(self.execution_timeout, self.store.execute(query)).await {
            Ok(result) => result,
            Err(_) => Err(DqError::QueryExecution(format!(
                "query timed out after {} seconds",
                self.execution_timeout.as_secs()
            ))),
        }
    }
}
