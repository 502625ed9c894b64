//! Table and column resolution.
//!
//! Every table or column name arriving from outside (API callers, model
//! output) is checked against the live schema here before it is ever
//! spliced into SQL text.

use crate::error::{DqError, Result};
use crate::store::DataStore;
use std::sync::Arc;

/// Quote an identifier for SQL interpolation. Only called on names that
/// already passed the allow-list checks below.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Clone)]
pub struct SchemaResolver {
    store: Arc<dyn DataStore>,
}

impl SchemaResolver {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn assert_table(&self, table: &str) -> Result<()> {
        let tables = self.store.list_tables().await?;
        if tables.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(DqError::UnknownTable(table.to_string()))
        }
    }

    pub async fn assert_column(&self, table: &str, column: &str) -> Result<()> {
        self.assert_table(table).await?;
        let columns = self.store.list_columns(table).await?;
        if columns.iter().any(|c| c == column) {
            Ok(())
        } else {
            Err(DqError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    /// Schema text for one table, for prompt grounding.
    pub async fn resolve(&self, table: &str) -> Result<String> {
        self.assert_table(table).await?;
        self.store.describe_schema(&[table.to_string()]).await
    }

    /// Schema text for several tables. Unknown names fail the whole call.
    pub async fn resolve_many(&self, tables: &[String]) -> Result<String> {
        for table in tables {
            self.assert_table(table).await?;
        }
        self.store.describe_schema(tables).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn resolver() -> SchemaResolver {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE plants (id INTEGER PRIMARY KEY, postcode TEXT);
                 INSERT INTO plants (id, postcode) VALUES (1, '10115');",
            )
            .unwrap();
        SchemaResolver::new(Arc::new(store))
    }

    #[tokio::test]
    async fn resolve_returns_schema_text() {
        let schema = resolver().resolve("plants").await.unwrap();
        assert!(schema.contains("CREATE TABLE plants"));
    }

    #[tokio::test]
    async fn unknown_table_is_rejected() {
        let err = resolver().resolve("factories").await.unwrap_err();
        assert!(matches!(err, DqError::UnknownTable(t) if t == "factories"));
    }

    #[tokio::test]
    async fn unknown_column_is_rejected() {
        let err = resolver()
            .assert_column("plants", "capacity")
            .await
            .unwrap_err();
        assert!(matches!(err, DqError::UnknownColumn { .. }));
    }

    #[tokio::test]
    async fn known_column_passes() {
        resolver().assert_column("plants", "postcode").await.unwrap();
    }

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("plants"), "\"plants\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
