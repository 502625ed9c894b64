//! Rule-to-SQL compilation loop.
//!
//! A compilation walks GENERATE -> CHECK_QUERY -> RUN_QUERY rounds until
//! the model settles on a final query or asks the user something. Every
//! candidate query is reviewed by a second model pass, executed against
//! the live data, and the observed result (or error) is fed back into the
//! next generation round. The loop is bounded; a model that never settles
//! ends in `CompilationTimeout`.

use crate::error::{DqError, Result};
use crate::llm::{
    parse_query_argument, run_query_tool, ChatMessage, LanguageModel, ModelReply, ToolCall,
    ToolChoice, ToolDefinition,
};
use crate::prompts::{self, QUERY_MARKER, QUESTION_MARKER};
use crate::safety::QueryGuard;
use crate::schema::SchemaResolver;
use crate::session::new_thread_id;
use crate::store::DataStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Full GENERATE/CHECK_QUERY/RUN_QUERY rounds before giving up.
    pub max_rounds: u32,
    pub model_timeout: Duration,
    pub execution_timeout: Duration,
    /// Result rows echoed back to the model after a trial execution.
    pub feedback_rows: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            model_timeout: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(30),
            feedback_rows: 50,
        }
    }
}

/// Terminal outcome of a compilation.
#[derive(Debug, Clone, PartialEq)]
pub enum Compilation {
    /// The model settled on a query; it passed the safety guard.
    Ready { query: String, thread_id: String },
    /// The model needs more information from the user. The caller re-runs
    /// `compile` with revised rule text.
    NeedsClarification { question: String, thread_id: String },
}

enum State {
    Generate,
    CheckQuery { proposal: ToolCall, reply_id: String },
    RunQuery { call: ToolCall },
}

pub struct RuleCompiler {
    llm: Arc<dyn LanguageModel>,
    store: Arc<dyn DataStore>,
    resolver: SchemaResolver,
    guard: QueryGuard,
    config: CompilerConfig,
}

impl RuleCompiler {
    pub fn new(llm: Arc<dyn LanguageModel>, store: Arc<dyn DataStore>) -> Self {
        Self::with_config(llm, store, CompilerConfig::default())
    }

    pub fn with_config(
        llm: Arc<dyn LanguageModel>,
        store: Arc<dyn DataStore>,
        config: CompilerConfig,
    ) -> Self {
        let resolver = SchemaResolver::new(store.clone());
        Self {
            llm,
            store,
            resolver,
            guard: QueryGuard::new(),
            config,
        }
    }

    /// Compile one natural-language rule against `table_name.column_name`.
    pub async fn compile(
        &self,
        rule_text: &str,
        table_name: &str,
        column_name: &str,
    ) -> Result<Compilation> {
        let thread_id = new_thread_id();
        self.resolver.assert_column(table_name, column_name).await?;
        let schema = self.store.describe_schema(&[table_name.to_string()]).await?;

        let generate_system = prompts::build_generate_query_prompt(
            self.store.dialect(),
            &schema,
            table_name,
            column_name,
        );
        let review_system = prompts::build_check_query_prompt(self.store.dialect());
        let tools = vec![run_query_tool()];

        let mut transcript: Vec<ChatMessage> = vec![ChatMessage::user(rule_text)];
        let mut state = State::Generate;
        let mut round = 0u32;

        loop {
            match state {
                State::Generate => {
                    round += 1;
                    if round > self.config.max_rounds {
                        info!(%thread_id, rounds = self.config.max_rounds, "compilation gave up");
                        return Err(DqError::CompilationTimeout {
                            rounds: self.config.max_rounds,
                        });
                    }
                    debug!(%thread_id, round, "generate");

                    let mut messages = Vec::with_capacity(transcript.len() + 1);
                    messages.push(ChatMessage::system(&generate_system));
                    messages.extend(transcript.iter().cloned());
                    let reply = self.invoke(round, &messages, &tools, ToolChoice::Auto).await?;

                    if reply.tool_calls.is_empty() {
                        let text = reply.text().to_string();
                        return self.finish(&thread_id, &text);
                    }

                    let proposal = reply.tool_calls[0].clone();
                    expect_run_query(&proposal)?;
                    let reply_id = reply.id.clone();
                    transcript.push(reply.into_message());
                    state = State::CheckQuery { proposal, reply_id };
                }

                State::CheckQuery { proposal, reply_id } => {
                    let proposed_query = parse_query_argument(&proposal)?;
                    debug!(%thread_id, round, "check query");

                    let messages = vec![
                        ChatMessage::system(&review_system),
                        ChatMessage::user(&proposed_query),
                    ];
                    let mut review = self.invoke(round, &messages, &tools, ToolChoice::Any).await?;

                    let call = review.tool_calls.first().cloned().ok_or_else(|| {
                        DqError::AmbiguousModelResponse(
                            "review step returned no tool call".to_string(),
                        )
                    })?;
                    expect_run_query(&call)?;

                    // The reviewed query supersedes the proposal: it takes
                    // over the proposal's message slot and id so the
                    // transcript holds exactly one candidate per round.
                    review.id = reply_id;
                    transcript.pop();
                    transcript.push(review.into_message());
                    state = State::RunQuery { call };
                }

                State::RunQuery { call } => {
                    let query = parse_query_argument(&call)?;
                    self.guard.check(&query)?;
                    debug!(%thread_id, round, %query, "run query");

                    let feedback = match timeout(
                        self.config.execution_timeout,
                        self.store.execute(&query),
                    )
                    .await
                    {
                        Ok(Ok(rows)) => rows.render(self.config.feedback_rows),
                        Ok(Err(DqError::QueryExecution(message))) => {
                            debug!(%thread_id, round, %message, "trial execution failed");
                            format!("Error: {}", message)
                        }
                        Ok(Err(other)) => return Err(other),
                        Err(_) => format!(
                            "Error: query timed out after {} seconds",
                            self.config.execution_timeout.as_secs()
                        ),
                    };

                    transcript.push(ChatMessage::tool_result(call.id.clone(), feedback));
                    state = State::Generate;
                }
            }
        }
    }

    fn finish(&self, thread_id: &str, text: &str) -> Result<Compilation> {
        match parse_terminal(text)? {
            Terminal::Query(query) => {
                self.guard.check(&query)?;
                info!(%thread_id, "compilation ready");
                Ok(Compilation::Ready {
                    query,
                    thread_id: thread_id.to_string(),
                })
            }
            Terminal::Question(question) => {
                info!(%thread_id, "compilation needs clarification");
                Ok(Compilation::NeedsClarification {
                    question,
                    thread_id: thread_id.to_string(),
                })
            }
        }
    }

    /// Model call under the configured timeout. A stalled model ends the
    /// compilation as a timeout in the round it stalled, same as a model
    /// that never settles.
    async fn invoke(
        &self,
        round: u32,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        choice: ToolChoice,
    ) -> Result<ModelReply> {
        match timeout(
            self.config.model_timeout,
            self.llm.invoke(messages, tools, choice),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DqError::CompilationTimeout { rounds: round }),
        }
    }
}

enum Terminal {
    Query(String),
    Question(String),
}

/// Strict anchored parse of a terminal reply. The marker must open the
/// message (any letter case); anything else is an error, never a guess.
fn parse_terminal(text: &str) -> Result<Terminal> {
    let trimmed = text.trim();
    if let Some(rest) = strip_marker(trimmed, QUERY_MARKER) {
        let query = rest.trim();
        if query.is_empty() {
            return Err(DqError::AmbiguousModelResponse(
                "empty query after QUERY marker".to_string(),
            ));
        }
        return Ok(Terminal::Query(query.to_string()));
    }
    if let Some(rest) = strip_marker(trimmed, QUESTION_MARKER) {
        let question = rest.trim();
        if question.is_empty() {
            return Err(DqError::AmbiguousModelResponse(
                "empty question after QUESTION marker".to_string(),
            ));
        }
        return Ok(Terminal::Question(question.to_string()));
    }
    Err(DqError::AmbiguousModelResponse(preview(trimmed)))
}

fn strip_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let head = text.get(..marker.len())?;
    if head.eq_ignore_ascii_case(marker) {
        text.get(marker.len()..)
    } else {
        None
    }
}

fn expect_run_query(call: &ToolCall) -> Result<()> {
    if call.name == "run_query" {
        Ok(())
    } else {
        Err(DqError::AmbiguousModelResponse(format!(
            "unexpected tool call: {}",
            call.name
        )))
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 160;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}
