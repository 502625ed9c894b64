//! Conversational assistant for exploring one column.
//!
//! Chats are persisted per thread id so a conversation can be resumed.
//! The model gets read-only tools; tool failures are echoed back into the
//! conversation instead of ending it, since the user can steer from there.

use crate::error::{DqError, Result};
use crate::llm::{
    describe_schema_tool, list_tables_tool, parse_query_argument, run_query_tool, ChatMessage,
    LanguageModel, ToolCall, ToolChoice,
};
use crate::prompts::{self, RULE_MARKER};
use crate::safety::QueryGuard;
use crate::schema::SchemaResolver;
use crate::session::{new_thread_id, SessionStore};
use crate::store::DataStore;
use std::sync::Arc;
use tracing::debug;

const FEEDBACK_ROWS: usize = 50;

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub thread_id: String,
    pub answer: String,
}

pub struct ColumnAssistant {
    llm: Arc<dyn LanguageModel>,
    store: Arc<dyn DataStore>,
    resolver: SchemaResolver,
    guard: QueryGuard,
    sessions: Arc<SessionStore>,
    max_tool_rounds: u32,
}

impl ColumnAssistant {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        store: Arc<dyn DataStore>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        let resolver = SchemaResolver::new(store.clone());
        Self {
            llm,
            store,
            resolver,
            guard: QueryGuard::new(),
            sessions,
            max_tool_rounds: 5,
        }
    }

    /// One user turn. Passing back the returned `thread_id` resumes the
    /// same conversation; omitting it starts a fresh one.
    pub async fn chat(
        &self,
        user_input: &str,
        table_name: &str,
        column_name: &str,
        thread_id: Option<&str>,
    ) -> Result<ChatReply> {
        self.resolver.assert_column(table_name, column_name).await?;

        let thread_id = thread_id
            .map(str::to_string)
            .unwrap_or_else(new_thread_id);
        self.sessions.append(&thread_id, ChatMessage::user(user_input));

        let system = prompts::build_column_assistant_prompt(table_name, column_name);
        let tools = vec![run_query_tool(), describe_schema_tool(), list_tables_tool()];

        for round in 0..self.max_tool_rounds {
            let mut messages = vec![ChatMessage::system(&system)];
            messages.extend(self.sessions.history(&thread_id));

            let reply = self.llm.invoke(&messages, &tools, ToolChoice::Auto).await?;
            let answer = reply.text().to_string();
            let tool_calls = reply.tool_calls.clone();
            self.sessions.append(&thread_id, reply.into_message());

            if tool_calls.is_empty() {
                return Ok(ChatReply { thread_id, answer });
            }

            for call in &tool_calls {
                debug!(%thread_id, round, tool = %call.name, "assistant tool call");
                let output = match self.dispatch_tool(call).await {
                    Ok(output) => output,
                    Err(e) => format!("Error: {}", e),
                };
                self.sessions
                    .append(&thread_id, ChatMessage::tool_result(call.id.clone(), output));
            }
        }

        Err(DqError::Llm(format!(
            "assistant exceeded {} tool rounds without answering",
            self.max_tool_rounds
        )))
    }

    /// Pull the bare rule text out of an assistant reply that contained a
    /// `RULE:` proposal, via the extraction prompt.
    pub async fn extract_rule(&self, response_text: &str) -> Result<String> {
        let messages = vec![
            ChatMessage::system(prompts::EXTRACT_RULE_PROMPT),
            ChatMessage::user(response_text),
        ];
        let reply = self.llm.invoke(&messages, &[], ToolChoice::Auto).await?;

        let text = reply.text().trim();
        let rule = text
            .strip_prefix(RULE_MARKER)
            .map(str::trim)
            .unwrap_or(text);
        if rule.is_empty() {
            return Err(DqError::AmbiguousModelResponse(
                "no rule found in response".to_string(),
            ));
        }
        Ok(rule.to_string())
    }

    async fn dispatch_tool(&self, call: &ToolCall) -> Result<String> {
        match call.name.as_str() {
            "run_query" => {
                let query = parse_query_argument(call)?;
                self.guard.check(&query)?;
                let rows = self.store.execute(&query).await?;
                Ok(rows.render(FEEDBACK_ROWS))
            }
            "describe_schema" => {
                let tables = parse_tables_argument(call)?;
                self.resolver.resolve_many(&tables).await
            }
            "list_tables" => Ok(self.store.list_tables().await?.join(", ")),
            other => Err(DqError::Llm(format!("unknown tool: {}", other))),
        }
    }
}

fn parse_tables_argument(call: &ToolCall) -> Result<Vec<String>> {
    let args: serde_json::Value = serde_json::from_str(&call.arguments).map_err(|e| {
        DqError::AmbiguousModelResponse(format!("Malformed tool call arguments: {}", e))
    })?;
    let tables = args
        .get("tables")
        .and_then(|t| t.as_array())
        .ok_or_else(|| {
            DqError::AmbiguousModelResponse("tool call carried no tables argument".to_string())
        })?;
    Ok(tables
        .iter()
        .filter_map(|t| t.as_str())
        .map(|t| t.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelReply, ToolDefinition};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<VecDeque<ModelReply>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<ModelReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn invoke(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _tool_choice: ToolChoice,
        ) -> Result<ModelReply> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| DqError::Llm("script exhausted".to_string()))
        }
    }

    fn text_reply(text: &str) -> ModelReply {
        ModelReply {
            id: "r".to_string(),
            content: Some(text.to_string()),
            tool_calls: vec![],
        }
    }

    fn tool_reply(call_id: &str, name: &str, arguments: serde_json::Value) -> ModelReply {
        ModelReply {
            id: "r".to_string(),
            content: None,
            tool_calls: vec![ToolCall {
                id: call_id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }

    fn assistant(model: Arc<ScriptedModel>) -> (ColumnAssistant, Arc<SessionStore>) {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE plants (id INTEGER PRIMARY KEY, postcode TEXT);
                 INSERT INTO plants (id, postcode) VALUES (1, '10115'), (2, '209');",
            )
            .unwrap();
        let sessions = Arc::new(SessionStore::new());
        (
            ColumnAssistant::new(model, Arc::new(store), sessions.clone()),
            sessions,
        )
    }

    #[tokio::test]
    async fn plain_answer_is_returned_and_recorded() {
        let model = ScriptedModel::new(vec![text_reply("The column holds German postcodes.")]);
        let (assistant, sessions) = assistant(model);

        let reply = assistant
            .chat("What is this column?", "plants", "postcode", None)
            .await
            .unwrap();
        assert_eq!(reply.answer, "The column holds German postcodes.");

        let history = sessions.history(&reply.thread_id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_into_the_conversation() {
        let model = ScriptedModel::new(vec![
            tool_reply(
                "call_1",
                "run_query",
                serde_json::json!({ "query": "SELECT postcode FROM plants LIMIT 2" }),
            ),
            text_reply("Two sample values are 10115 and 209."),
        ]);
        let (assistant, sessions) = assistant(model);

        let reply = assistant
            .chat("Show me some values", "plants", "postcode", None)
            .await
            .unwrap();
        assert!(reply.answer.contains("10115"));

        let history = sessions.history(&reply.thread_id);
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, "tool");
        assert!(history[2].content.as_deref().unwrap().contains("10115"));
    }

    #[tokio::test]
    async fn unsafe_tool_queries_fail_softly() {
        let model = ScriptedModel::new(vec![
            tool_reply(
                "call_1",
                "run_query",
                serde_json::json!({ "query": "DROP TABLE plants" }),
            ),
            text_reply("I cannot run that, it would modify the data."),
        ]);
        let (assistant, sessions) = assistant(model);

        let reply = assistant
            .chat("Drop the table", "plants", "postcode", None)
            .await
            .unwrap();

        let history = sessions.history(&reply.thread_id);
        let tool_output = history[2].content.as_deref().unwrap();
        assert!(tool_output.starts_with("Error:"));
        assert!(tool_output.contains("Unsafe query"));
    }

    #[tokio::test]
    async fn threads_resume_with_prior_context() {
        let model = ScriptedModel::new(vec![
            text_reply("It holds postcodes."),
            text_reply("Most are 5 characters long."),
        ]);
        let (assistant, sessions) = assistant(model);

        let first = assistant
            .chat("What is this?", "plants", "postcode", None)
            .await
            .unwrap();
        let second = assistant
            .chat("And their lengths?", "plants", "postcode", Some(&first.thread_id))
            .await
            .unwrap();

        assert_eq!(first.thread_id, second.thread_id);
        assert_eq!(sessions.history(&first.thread_id).len(), 4);
    }

    #[tokio::test]
    async fn endless_tool_calls_hit_the_round_bound() {
        let replies = (0..10)
            .map(|i| {
                tool_reply(
                    &format!("call_{}", i),
                    "run_query",
                    serde_json::json!({ "query": "SELECT 1" }),
                )
            })
            .collect();
        let model = ScriptedModel::new(replies);
        let (assistant, _) = assistant(model);

        let err = assistant
            .chat("Loop forever", "plants", "postcode", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DqError::Llm(_)));
    }

    #[tokio::test]
    async fn extract_rule_strips_the_marker() {
        let model =
            ScriptedModel::new(vec![text_reply("RULE: Postcodes must be 5 characters long")]);
        let (assistant, _) = assistant(model);

        let rule = assistant
            .extract_rule("I suggest this. RULE: Postcodes must be 5 characters long")
            .await
            .unwrap();
        assert_eq!(rule, "Postcodes must be 5 characters long");
    }

    #[tokio::test]
    async fn unknown_column_is_rejected() {
        let model = ScriptedModel::new(vec![]);
        let (assistant, _) = assistant(model);
        let err = assistant
            .chat("hello", "plants", "capacity", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DqError::UnknownColumn { .. }));
    }
}
