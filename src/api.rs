//! Service facade tying the components together.
//!
//! Both binaries (CLI and HTTP server) talk to `DqService` only; nothing
//! outside this crate wires the components directly.

use crate::assistant::{ChatReply, ColumnAssistant};
use crate::browse::TableBrowser;
use crate::compiler::{Compilation, CompilerConfig, RuleCompiler};
use crate::error::Result;
use crate::llm::LanguageModel;
use crate::rule_store::{RuleRecord, RuleStore};
use crate::safety::QueryGuard;
use crate::sampler::{SampleSet, Sampler};
use crate::schema::SchemaResolver;
use crate::session::SessionStore;
use crate::store::{DataStore, QueryRows};
use crate::suggest::RuleSuggester;
use crate::validator::{QueryValidator, ValidationReport};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Outcome of compiling one rule, including match statistics when the
/// compilation produced a runnable query.
#[derive(Debug, Clone, Serialize)]
pub struct RuleConversion {
    pub thread_id: String,
    pub ready: bool,
    pub sql_query: Option<String>,
    pub question: Option<String>,
    pub report: Option<ValidationReport>,
}

pub struct DqService {
    store: Arc<dyn DataStore>,
    rules: RuleStore,
    resolver: SchemaResolver,
    sampler: Sampler,
    guard: QueryGuard,
    compiler: RuleCompiler,
    validator: QueryValidator,
    suggester: RuleSuggester,
    assistant: ColumnAssistant,
    browser: TableBrowser,
}

impl DqService {
    pub fn new(store: Arc<dyn DataStore>, rules: RuleStore, llm: Arc<dyn LanguageModel>) -> Self {
        Self::with_config(store, rules, llm, CompilerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn DataStore>,
        rules: RuleStore,
        llm: Arc<dyn LanguageModel>,
        config: CompilerConfig,
    ) -> Self {
        let resolver = SchemaResolver::new(store.clone());
        let sampler = Sampler::new(store.clone(), resolver.clone());
        let sessions = Arc::new(SessionStore::new());
        let compiler = RuleCompiler::with_config(llm.clone(), store.clone(), config.clone());
        let validator = QueryValidator::with_timeout(store.clone(), config.execution_timeout);
        let suggester = RuleSuggester::new(llm.clone(), store.clone());
        let assistant = ColumnAssistant::new(llm, store.clone(), sessions);
        let browser = TableBrowser::new(store.clone());

        Self {
            store,
            rules,
            resolver,
            sampler,
            guard: QueryGuard::new(),
            compiler,
            validator,
            suggester,
            assistant,
            browser,
        }
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        self.store.list_tables().await
    }

    pub async fn table_schema(&self, table_name: &str) -> Result<String> {
        self.resolver.resolve(table_name).await
    }

    pub async fn sample_values(
        &self,
        table_name: &str,
        column_name: &str,
        limit: usize,
    ) -> Result<SampleSet> {
        self.sampler.top_values(table_name, column_name, limit).await
    }

    /// Compile a natural-language rule. A ready query is validated
    /// against the live data before it is handed back.
    pub async fn convert_rule(
        &self,
        rule_text: &str,
        table_name: &str,
        column_name: &str,
    ) -> Result<RuleConversion> {
        match self
            .compiler
            .compile(rule_text, table_name, column_name)
            .await?
        {
            Compilation::Ready { query, thread_id } => {
                let report = self.validator.validate(&query, table_name, column_name).await?;
                Ok(RuleConversion {
                    thread_id,
                    ready: true,
                    sql_query: Some(query),
                    question: None,
                    report: Some(report),
                })
            }
            Compilation::NeedsClarification { question, thread_id } => Ok(RuleConversion {
                thread_id,
                ready: false,
                sql_query: None,
                question: Some(question),
                report: None,
            }),
        }
    }

    /// Store a confirmed rule under a fresh id.
    pub async fn add_rule(
        &self,
        rule_text: &str,
        table_name: &str,
        column_name: &str,
        rule_category: &str,
        sql_query: &str,
    ) -> Result<RuleRecord> {
        self.resolver.assert_column(table_name, column_name).await?;
        self.guard.check(sql_query)?;

        let record = RuleRecord {
            rule_id: Uuid::new_v4().to_string(),
            rule: rule_text.to_string(),
            table_name: table_name.to_string(),
            column_name: column_name.to_string(),
            rule_category: rule_category.to_string(),
            sql_query: sql_query.to_string(),
        };
        self.rules.insert(&record)?;
        info!(rule_id = %record.rule_id, table = table_name, column = column_name, "rule stored");
        Ok(record)
    }

    /// Remove a stored rule. Returns whether anything was removed.
    pub async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let removed = self.rules.delete(rule_id)?;
        if removed {
            info!(%rule_id, "rule deleted");
        }
        Ok(removed)
    }

    pub async fn rules_of_table(&self, table_name: &str) -> Result<Vec<RuleRecord>> {
        self.rules.rules_for_table(table_name)
    }

    pub async fn rules_on_column(
        &self,
        table_name: &str,
        column_name: &str,
    ) -> Result<Vec<String>> {
        self.rules.rule_texts_for_column(table_name, column_name)
    }

    /// Suggest one new rule, deduplicated against stored rules plus any
    /// extra texts the caller already has in flight.
    pub async fn suggest_rule(
        &self,
        table_name: &str,
        column_name: &str,
        extra_rules: &[String],
    ) -> Result<Option<String>> {
        let mut existing = self.rules.rule_texts_for_column(table_name, column_name)?;
        for rule in extra_rules {
            if !existing.iter().any(|e| e == rule) {
                existing.push(rule.clone());
            }
        }
        self.suggester.suggest(table_name, column_name, &existing).await
    }

    pub async fn validate_query(
        &self,
        query: &str,
        table_name: &str,
        column_name: &str,
    ) -> Result<ValidationReport> {
        self.validator.validate(query, table_name, column_name).await
    }

    pub async fn browse_table(
        &self,
        table_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<QueryRows> {
        self.browser.table_page(table_name, limit, offset).await
    }

    pub async fn browse_column(
        &self,
        table_name: &str,
        column_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<QueryRows> {
        self.browser
            .column_page(table_name, column_name, limit, offset)
            .await
    }

    pub async fn chat(
        &self,
        message: &str,
        table_name: &str,
        column_name: &str,
        thread_id: Option<&str>,
    ) -> Result<ChatReply> {
        self.assistant
            .chat(message, table_name, column_name, thread_id)
            .await
    }

    pub async fn extract_rule(&self, response_text: &str) -> Result<String> {
        self.assistant.extract_rule(response_text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DqError;
    use crate::llm::{ChatMessage, ModelReply, ToolChoice, ToolDefinition};
    use crate::store::SqliteStore;
    use async_trait::async_trait;

    struct SilentModel;

    #[async_trait]
    impl LanguageModel for SilentModel {
        async fn invoke(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _tool_choice: ToolChoice,
        ) -> Result<ModelReply> {
            Err(DqError::Llm("no model in this test".to_string()))
        }
    }

    fn service() -> DqService {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE plants (id INTEGER PRIMARY KEY, postcode TEXT);
                 INSERT INTO plants (id, postcode) VALUES (1, '10115'), (2, '209');",
            )
            .unwrap();
        DqService::new(
            Arc::new(store),
            RuleStore::in_memory().unwrap(),
            Arc::new(SilentModel),
        )
    }

    #[tokio::test]
    async fn add_rule_assigns_an_id_and_lists_back() {
        let service = service();
        let record = service
            .add_rule(
                "Postcodes must be 5 characters",
                "plants",
                "postcode",
                "format",
                "SELECT ROW_NUMBER() OVER (ORDER BY (SELECT NULL)) AS row_num FROM plants WHERE LENGTH(postcode) = 5",
            )
            .await
            .unwrap();
        assert!(!record.rule_id.is_empty());

        let rules = service.rules_of_table("plants").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_id, record.rule_id);
    }

    #[tokio::test]
    async fn add_rule_rejects_mutating_queries() {
        let service = service();
        let err = service
            .add_rule(
                "Bad rule",
                "plants",
                "postcode",
                "format",
                "DELETE FROM plants",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DqError::UnsafeQuery(_)));
        assert!(service.rules_of_table("plants").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_rule_rejects_unknown_identifiers() {
        let service = service();
        let err = service
            .add_rule("Rule", "plants", "capacity", "format", "SELECT 1")
            .await
            .unwrap_err();
        assert!(matches!(err, DqError::UnknownColumn { .. }));
    }

    #[tokio::test]
    async fn delete_rule_reports_whether_anything_was_removed() {
        let service = service();
        let record = service
            .add_rule(
                "Postcodes must not be null",
                "plants",
                "postcode",
                "completeness",
                "SELECT ROW_NUMBER() OVER (ORDER BY (SELECT NULL)) AS row_num FROM plants WHERE postcode IS NOT NULL",
            )
            .await
            .unwrap();

        assert!(service.delete_rule(&record.rule_id).await.unwrap());
        assert!(!service.delete_rule(&record.rule_id).await.unwrap());
        assert!(!service.delete_rule("never-existed").await.unwrap());
    }
}
