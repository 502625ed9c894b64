//! Persistence for confirmed data quality rules.
//!
//! Rules live in a single `rule_storage` table in their own SQLite
//! database, separate from the source data being checked.

use crate::error::{DqError, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// One confirmed rule with its compiled query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub rule_id: String,
    pub rule: String,
    pub table_name: String,
    pub column_name: String,
    pub rule_category: String,
    pub sql_query: String,
}

pub struct RuleStore {
    db: Mutex<Connection>,
}

impl RuleStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| DqError::RuleStore(format!("Failed to open database: {}", e)))?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| DqError::RuleStore(format!("Failed to open database: {}", e)))?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().unwrap();

        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS rule_storage (
                rule_id TEXT PRIMARY KEY,
                rule TEXT NOT NULL,
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                rule_category TEXT NOT NULL,
                sql_query TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| DqError::RuleStore(format!("Failed to create table: {}", e)))?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_rule_table_column ON rule_storage(table_name, column_name)",
            [],
        )
        .map_err(|e| DqError::RuleStore(format!("Failed to create index: {}", e)))?;

        Ok(())
    }

    pub fn insert(&self, record: &RuleRecord) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            r#"
            INSERT INTO rule_storage (rule_id, rule, table_name, column_name, rule_category, sql_query)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.rule_id,
                record.rule,
                record.table_name,
                record.column_name,
                record.rule_category,
                record.sql_query,
            ],
        )
        .map_err(|e| DqError::RuleStore(format!("Failed to insert rule: {}", e)))?;
        Ok(())
    }

    pub fn get(&self, rule_id: &str) -> Result<Option<RuleRecord>> {
        let db = self.db.lock().unwrap();
        let result = db.query_row(
            "SELECT rule_id, rule, table_name, column_name, rule_category, sql_query
             FROM rule_storage WHERE rule_id = ?1",
            params![rule_id],
            |row| {
                Ok(RuleRecord {
                    rule_id: row.get(0)?,
                    rule: row.get(1)?,
                    table_name: row.get(2)?,
                    column_name: row.get(3)?,
                    rule_category: row.get(4)?,
                    sql_query: row.get(5)?,
                })
            },
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DqError::RuleStore(format!("Failed to read rule: {}", e))),
        }
    }

    /// Remove a rule. Deleting an id that is not stored is not an error;
    /// the return value says whether anything was removed.
    pub fn delete(&self, rule_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let affected = db
            .execute("DELETE FROM rule_storage WHERE rule_id = ?1", params![rule_id])
            .map_err(|e| DqError::RuleStore(format!("Failed to delete rule: {}", e)))?;
        Ok(affected > 0)
    }

    pub fn rules_for_table(&self, table_name: &str) -> Result<Vec<RuleRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare(
                "SELECT rule_id, rule, table_name, column_name, rule_category, sql_query
                 FROM rule_storage WHERE table_name = ?1 ORDER BY rowid",
            )
            .map_err(|e| DqError::RuleStore(format!("Failed to query rules: {}", e)))?;

        let records = stmt
            .query_map(params![table_name], |row| {
                Ok(RuleRecord {
                    rule_id: row.get(0)?,
                    rule: row.get(1)?,
                    table_name: row.get(2)?,
                    column_name: row.get(3)?,
                    rule_category: row.get(4)?,
                    sql_query: row.get(5)?,
                })
            })
            .map_err(|e| DqError::RuleStore(format!("Failed to query rules: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DqError::RuleStore(format!("Failed to read rule row: {}", e)))?;

        Ok(records)
    }

    /// Rule texts already confirmed for one column, oldest first. Used to
    /// keep new suggestions from repeating what is stored.
    pub fn rule_texts_for_column(&self, table_name: &str, column_name: &str) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare(
                "SELECT rule FROM rule_storage
                 WHERE table_name = ?1 AND column_name = ?2 ORDER BY rowid",
            )
            .map_err(|e| DqError::RuleStore(format!("Failed to query rules: {}", e)))?;

        let texts = stmt
            .query_map(params![table_name, column_name], |row| row.get::<_, String>(0))
            .map_err(|e| DqError::RuleStore(format!("Failed to query rules: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DqError::RuleStore(format!("Failed to read rule row: {}", e)))?;

        Ok(texts)
    }
}
