//! Source database access.
//!
//! The compiler, validator and assistant only see the `DataStore` trait;
//! `SqliteStore` is the embedded implementation backed by rusqlite.

use crate::error::{DqError, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

/// Result table from a read query, cells as dynamically typed JSON values.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryRows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Render as pipe-separated text for model feedback, capped at
    /// `max_rows` data rows.
    pub fn render(&self, max_rows: usize) -> String {
        if self.rows.is_empty() {
            return "(no rows)".to_string();
        }

        let mut out = self.columns.join(" | ");
        for row in self.rows.iter().take(max_rows) {
            let cells: Vec<String> = row.iter().map(render_cell).collect();
            out.push('\n');
            out.push_str(&cells.join(" | "));
        }
        if self.rows.len() > max_rows {
            out.push_str(&format!("\n... ({} rows total)", self.rows.len()));
        }
        out
    }
}

fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// SQL dialect name advertised to prompts, e.g. "sqlite".
    fn dialect(&self) -> &str;

    /// Run a read query and return its rows. The caller is responsible for
    /// passing the query through the safety guard first.
    async fn execute(&self, query: &str) -> Result<QueryRows>;

    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn list_columns(&self, table: &str) -> Result<Vec<String>>;

    /// Textual schema of the given tables, suitable for prompt grounding:
    /// column names and types plus a few sample rows.
    async fn describe_schema(&self, tables: &[String]) -> Result<String>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run DDL/DML directly, bypassing the read-only surface. Used for
    /// loading fixtures.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn run_query(&self, query: &str) -> Result<QueryRows> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(query)
            .map_err(|e| DqError::QueryExecution(e.to_string()))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let column_count = columns.len();

        let mut rows = stmt
            .query([])
            .map_err(|e| DqError::QueryExecution(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| DqError::QueryExecution(e.to_string()))?
        {
            let mut record = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = row
                    .get_ref(i)
                    .map_err(|e| DqError::QueryExecution(e.to_string()))?;
                record.push(value_ref_to_json(value));
            }
            out.push(record);
        }

        Ok(QueryRows {
            columns,
            rows: out,
        })
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn column_names(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
        let names = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn table_description(&self, table: &str) -> Result<String> {
        let conn = self.conn.lock().unwrap();

        let mut stmt =
            conn.prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1)")?;
        let columns = stmt
            .query_map([table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut out = format!("CREATE TABLE {} (\n", table);
        for (i, (name, column_type, notnull, pk)) in columns.iter().enumerate() {
            out.push_str(&format!("\t{} {}", name, column_type));
            if *pk > 0 {
                out.push_str(" PRIMARY KEY");
            }
            if *notnull > 0 {
                out.push_str(" NOT NULL");
            }
            if i + 1 < columns.len() {
                out.push(',');
            }
            out.push('\n');
        }
        out.push(')');
        drop(conn);

        // A few sample rows ground the model in real values.
        let sample = self.run_query(&format!(
            "SELECT * FROM \"{}\" LIMIT 3",
            table.replace('"', "\"\"")
        ))?;
        if !sample.is_empty() {
            out.push_str(&format!(
                "\n/*\n3 rows from {} table:\n{}\n*/",
                table,
                sample.render(3)
            ));
        }

        Ok(out)
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    fn dialect(&self) -> &str {
        "sqlite"
    }

    async fn execute(&self, query: &str) -> Result<QueryRows> {
        self.run_query(query)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.table_names()
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<String>> {
        self.column_names(table)
    }

    async fn describe_schema(&self, tables: &[String]) -> Result<String> {
        let mut parts = Vec::with_capacity(tables.len());
        for table in tables {
            parts.push(self.table_description(table)?);
        }
        Ok(parts.join("\n\n"))
    }
}
