//! Paged reads of source tables for inspection surfaces.

use crate::error::Result;
use crate::schema::{quote_ident, SchemaResolver};
use crate::store::{DataStore, QueryRows};
use std::sync::Arc;

/// Upper bound on one page of browsed rows.
pub const MAX_PAGE_ROWS: usize = 500;

pub struct TableBrowser {
    store: Arc<dyn DataStore>,
    resolver: SchemaResolver,
}

impl TableBrowser {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        let resolver = SchemaResolver::new(store.clone());
        Self { store, resolver }
    }

    pub async fn table_page(
        &self,
        table_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<QueryRows> {
        self.resolver.assert_table(table_name).await?;
        let limit = limit.clamp(1, MAX_PAGE_ROWS);
        let query = format!(
            "SELECT * FROM {} LIMIT {} OFFSET {}",
            quote_ident(table_name),
            limit,
            offset
        );
        self.store.execute(&query).await
    }

    pub async fn column_page(
        &self,
        table_name: &str,
        column_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<QueryRows> {
        self.resolver.assert_column(table_name, column_name).await?;
        let limit = limit.clamp(1, MAX_PAGE_ROWS);
        let query = format!(
            "SELECT {} FROM {} LIMIT {} OFFSET {}",
            quote_ident(column_name),
            quote_ident(table_name),
            limit,
            offset
        );
        self.store.execute(&query).await
    }
}
