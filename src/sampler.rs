//! Value-frequency sampling used to ground suggestion prompts.

use crate::error::Result;
use crate::schema::{quote_ident, SchemaResolver};
use crate::store::DataStore;
use itertools::Itertools;
use std::sync::Arc;

/// Hard cap on sampled distinct values per column.
pub const MAX_SAMPLE_VALUES: usize = 200;

/// Most frequent values of one column, highest count first.
#[derive(Debug, Clone)]
pub struct SampleSet {
    pub column: String,
    pub values: Vec<(serde_json::Value, i64)>,
}

impl SampleSet {
    /// Compact "value (count)" rendering for prompt text.
    pub fn render(&self) -> String {
        if self.values.is_empty() {
            return "(column is empty)".to_string();
        }
        self.values
            .iter()
            .map(|(value, count)| {
                let text = match value {
                    serde_json::Value::Null => "NULL".to_string(),
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{} ({})", text, count)
            })
            .join(", ")
    }
}

pub struct Sampler {
    store: Arc<dyn DataStore>,
    resolver: SchemaResolver,
}

impl Sampler {
    pub fn new(store: Arc<dyn DataStore>, resolver: SchemaResolver) -> Self {
        Self { store, resolver }
    }

    /// Distinct values of `column` with their frequencies, capped at
    /// `limit` (and never more than `MAX_SAMPLE_VALUES`).
    pub async fn top_values(
        &self,
        table: &str,
        column: &str,
        limit: usize,
    ) -> Result<SampleSet> {
        self.resolver.assert_column(table, column).await?;
        let limit = limit.clamp(1, MAX_SAMPLE_VALUES);

        let query = format!(
            "SELECT {col}, COUNT(*) AS value_count FROM {table} GROUP BY {col} ORDER BY value_count DESC LIMIT {limit}",
            col = quote_ident(column),
            table = quote_ident(table),
        );
        let rows = self.store.execute(&query).await?;

        let values = rows
            .rows
            .into_iter()
            .map(|mut row| {
                let count = row.get(1).and_then(|c| c.as_i64()).unwrap_or(0);
                let value = if row.is_empty() {
                    serde_json::Value::Null
                } else {
                    row.swap_remove(0)
                };
                (value, count)
            })
            .collect();

        Ok(SampleSet {
            column: column.to_string(),
            values,
        })
    }
}
