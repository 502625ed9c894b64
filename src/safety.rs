//! Read-only enforcement for model-generated SQL.
//!
//! Every query leaving the compiler or arriving from a caller passes
//! through `QueryGuard::check` before it reaches the database.

use crate::error::{DqError, Result};
use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

const BLOCKED_KEYWORDS: &str = r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|TRUNCATE|CREATE|REPLACE|ATTACH|DETACH|PRAGMA|VACUUM|REINDEX|ANALYZE)\b";

pub struct QueryGuard {
    blocked: Regex,
}

impl Default for QueryGuard {
    fn default() -> Self {
        Self {
            // The pattern is a constant, so compilation cannot fail.
            blocked: Regex::new(BLOCKED_KEYWORDS).unwrap(),
        }
    }
}

impl QueryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject anything that is not a single read statement.
    ///
    /// Statements that parse are checked structurally. When the parser
    /// cannot handle a dialect quirk, the keyword scan takes over; that
    /// path can reject a read query that uses a blocked word in function
    /// position, which is the safe direction to fail in.
    pub fn check(&self, query: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Err(DqError::UnsafeQuery("empty query".to_string()));
        }

        match Parser::parse_sql(&SQLiteDialect {}, query) {
            Ok(statements) => {
                if statements.is_empty() {
                    return Err(DqError::UnsafeQuery("empty query".to_string()));
                }
                if statements.len() > 1 {
                    return Err(DqError::UnsafeQuery(format!(
                        "expected a single statement, got {}",
                        statements.len()
                    )));
                }
                match &statements[0] {
                    Statement::Query(_) => Ok(()),
                    other => Err(DqError::UnsafeQuery(format!(
                        "not a read statement: {}",
                        truncate(&other.to_string(), 120)
                    ))),
                }
            }
            Err(_) => self.keyword_scan(query),
        }
    }

    fn keyword_scan(&self, query: &str) -> Result<()> {
        if let Some(found) = self.blocked.find(query) {
            return Err(DqError::UnsafeQuery(format!(
                "blocked keyword {}",
                found.as_str().to_uppercase()
            )));
        }
        Ok(())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_select_passes() {
        QueryGuard::new()
            .check("SELECT id FROM plants WHERE LENGTH(postcode) = 5")
            .unwrap();
    }

    #[test]
    fn cte_select_passes() {
        QueryGuard::new()
            .check("WITH good AS (SELECT id FROM plants) SELECT COUNT(*) FROM good")
            .unwrap();
    }

    #[test]
    fn replace_function_call_passes() {
        QueryGuard::new()
            .check("SELECT REPLACE(postcode, ' ', '') FROM plants")
            .unwrap();
    }

    #[test]
    fn insert_is_rejected() {
        let err = QueryGuard::new()
            .check("INSERT INTO plants (id) VALUES (99)")
            .unwrap_err();
        assert!(matches!(err, DqError::UnsafeQuery(_)));
    }

    #[test]
    fn lowercase_delete_is_rejected() {
        let err = QueryGuard::new()
            .check("delete from plants where id = 1")
            .unwrap_err();
        assert!(matches!(err, DqError::UnsafeQuery(_)));
    }

    #[test]
    fn drop_is_rejected() {
        assert!(QueryGuard::new().check("DROP TABLE plants").is_err());
    }

    #[test]
    fn pragma_is_rejected() {
        assert!(QueryGuard::new().check("PRAGMA writable_schema = 1").is_err());
    }

    #[test]
    fn multiple_statements_are_rejected() {
        let err = QueryGuard::new()
            .check("SELECT 1; DROP TABLE plants")
            .unwrap_err();
        assert!(matches!(err, DqError::UnsafeQuery(_)));
    }

    #[test]
    fn empty_query_is_rejected() {
        assert!(QueryGuard::new().check("   ").is_err());
    }

    #[test]
    fn keyword_scan_catches_mutations_in_unparseable_text() {
        let guard = QueryGuard::new();
        let err = guard.keyword_scan("?? DELETE FROM plants ??").unwrap_err();
        assert!(matches!(err, DqError::UnsafeQuery(_)));
        guard.keyword_scan("?? select something odd ??").unwrap();
    }
}
