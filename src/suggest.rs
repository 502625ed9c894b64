//! Model-driven rule suggestions for a column.

use crate::error::Result;
use crate::llm::{ChatMessage, LanguageModel, ToolChoice};
use crate::prompts::{self, RULE_MARKER};
use crate::sampler::{Sampler, MAX_SAMPLE_VALUES};
use crate::schema::SchemaResolver;
use crate::store::DataStore;
use std::sync::Arc;
use tracing::debug;

pub struct RuleSuggester {
    llm: Arc<dyn LanguageModel>,
    resolver: SchemaResolver,
    sampler: Sampler,
}

impl RuleSuggester {
    pub fn new(llm: Arc<dyn LanguageModel>, store: Arc<dyn DataStore>) -> Self {
        let resolver = SchemaResolver::new(store.clone());
        let sampler = Sampler::new(store, resolver.clone());
        Self {
            llm,
            resolver,
            sampler,
        }
    }

    /// Ask for one new rule on `table_name.column_name`.
    ///
    /// Returns `None` when the model declines (no `RULE:` marker in the
    /// reply) or when the proposal duplicates a rule in
    /// `existing_rules`. Both are normal outcomes, not errors.
    pub async fn suggest(
        &self,
        table_name: &str,
        column_name: &str,
        existing_rules: &[String],
    ) -> Result<Option<String>> {
        let schema = self.resolver.resolve(table_name).await?;
        let sample = self
            .sampler
            .top_values(table_name, column_name, MAX_SAMPLE_VALUES)
            .await?;

        let system = prompts::build_suggest_rule_prompt(
            column_name,
            table_name,
            &schema,
            &sample.render(),
            existing_rules,
        );
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user("Suggest one new data quality rule for this column."),
        ];
        let reply = self.llm.invoke(&messages, &[], ToolChoice::Auto).await?;

        let text = reply.text().trim();
        let Some(rest) = text.strip_prefix(RULE_MARKER) else {
            debug!(table = table_name, column = column_name, "no rule suggested");
            return Ok(None);
        };

        let rule = rest.trim();
        if rule.is_empty() {
            return Ok(None);
        }
        if existing_rules.iter().any(|existing| existing.trim() == rule) {
            debug!(table = table_name, column = column_name, "suggestion duplicates an existing rule");
            return Ok(None);
        }

        Ok(Some(rule.to_string()))
    }
}
