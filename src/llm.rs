//! OpenAI-compatible chat client with tool calling.
//!
//! Everything model-facing goes through the `LanguageModel` trait so the
//! compiler and assistant can be driven by scripted doubles in tests.

use crate::error::{DqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String, // JSON string
}

/// Message in OpenAI chat format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>, // for "tool" role
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// How the model is allowed to use the advertised tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// Model decides whether to call a tool.
    Auto,
    /// Model must call some tool.
    Any,
    /// Model must call the named tool.
    Tool(String),
}

/// Assistant reply: plain text, tool calls, or both.
///
/// `id` is the provider's completion id. The compiler overwrites it when a
/// reviewed query replaces the original proposal in a transcript, so the two
/// stay correlated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelReply {
    pub id: String,
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            role: "assistant".to_string(),
            content: self.content,
            tool_calls: self.tool_calls,
            tool_call_id: None,
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoice,
    ) -> Result<ModelReply>;
}

/// Tool schema for running a read-only SQL query against the source data.
pub fn run_query_tool() -> ToolDefinition {
    ToolDefinition {
        name: "run_query".to_string(),
        description: "Execute a read-only SQL query against the source database and return the resulting rows.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The SQL query to execute. Must be a single SELECT statement."
                }
            },
            "required": ["query"]
        }),
    }
}

/// Tool schema for describing the schema of one or more tables.
pub fn describe_schema_tool() -> ToolDefinition {
    ToolDefinition {
        name: "describe_schema".to_string(),
        description: "Return the schema of the given tables, including column names and types plus a few sample rows.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "tables": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Table names to describe."
                }
            },
            "required": ["tables"]
        }),
    }
}

/// Tool schema for listing the tables available in the source database.
pub fn list_tables_tool() -> ToolDefinition {
    ToolDefinition {
        name: "list_tables".to_string(),
        description: "List the names of all tables in the source database.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {},
            "required": []
        }),
    }
}

/// Pull the `query` argument out of a `run_query` tool call.
pub fn parse_query_argument(call: &ToolCall) -> Result<String> {
    let args: serde_json::Value = serde_json::from_str(&call.arguments).map_err(|e| {
        DqError::AmbiguousModelResponse(format!(
            "Malformed tool call arguments: {}. Arguments: {}",
            e, call.arguments
        ))
    })?;
    args.get("query")
        .and_then(|q| q.as_str())
        .map(|q| q.to_string())
        .ok_or_else(|| {
            DqError::AmbiguousModelResponse(format!(
                "Tool call carried no query argument: {}",
                call.arguments
            ))
        })
}

pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
        }
    }

    /// Build a client from `OPENAI_API_KEY`, `OPENAI_MODEL` and
    /// `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| DqError::Config("OPENAI_API_KEY not set".to_string()))?;
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Ok(Self::new(api_key, model, base_url))
    }

    fn api_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let mut msg = json!({ "role": m.role });

                if let Some(ref content) = m.content {
                    msg["content"] = json!(content);
                }

                if !m.tool_calls.is_empty() {
                    let calls: Vec<serde_json::Value> = m
                        .tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": { "name": c.name, "arguments": c.arguments }
                            })
                        })
                        .collect();
                    msg["tool_calls"] = json!(calls);
                }

                if let Some(ref tool_call_id) = m.tool_call_id {
                    msg["tool_call_id"] = json!(tool_call_id);
                }

                msg
            })
            .collect()
    }

    fn tool_choice_value(choice: &ToolChoice) -> serde_json::Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::Tool(name) => {
                json!({ "type": "function", "function": { "name": name } })
            }
        }
    }

    fn parse_tool_calls(message: &serde_json::Value) -> Result<Vec<ToolCall>> {
        let Some(raw_calls) = message.get("tool_calls").and_then(|t| t.as_array()) else {
            return Ok(Vec::new());
        };

        let mut calls = Vec::with_capacity(raw_calls.len());
        for raw in raw_calls {
            let id = raw["id"].as_str().unwrap_or_default().to_string();
            let function = &raw["function"];
            let name = function["name"]
                .as_str()
                .ok_or_else(|| DqError::Llm("No function name in tool call".to_string()))?
                .to_string();
            let arguments = function["arguments"]
                .as_str()
                .ok_or_else(|| DqError::Llm("No arguments in tool call".to_string()))?
                .to_string();
            calls.push(ToolCall {
                id,
                name,
                arguments,
            });
        }
        Ok(calls)
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        tool_choice: ToolChoice,
    ) -> Result<ModelReply> {
        let client = reqwest::Client::new();

        let mut body = json!({
            "model": self.model,
            "messages": Self::api_messages(messages),
            "temperature": 0.1,
        });

        if !tools.is_empty() {
            let api_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(api_tools);
            body["tool_choice"] = Self::tool_choice_value(&tool_choice);
        }

        // Use max_completion_tokens for newer models, max_tokens for older ones
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = json!(2000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = json!(1000);
        } else {
            body["max_tokens"] = json!(1000);
        }

        let response = client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| DqError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DqError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DqError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(DqError::Llm(format!(
                "LLM API error: {}",
                serde_json::to_string(error).unwrap_or_else(|_| "Unknown error".to_string())
            )));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .ok_or_else(|| DqError::Llm("No choices array in LLM response".to_string()))?;

        if choices.is_empty() {
            return Err(DqError::Llm(
                "Empty choices array in LLM response".to_string(),
            ));
        }

        if let Some(finish_reason) = choices[0].get("finish_reason").and_then(|r| r.as_str()) {
            if finish_reason == "length" {
                warn!("LLM response was truncated due to length limit");
            } else if finish_reason == "content_filter" {
                return Err(DqError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ));
            }
        }

        let message = &choices[0]["message"];
        let tool_calls = Self::parse_tool_calls(message)?;
        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .map(|c| c.to_string());

        if tool_calls.is_empty() && content.as_deref().unwrap_or("").is_empty() {
            return Err(DqError::Llm(format!(
                "Empty message in LLM response: {}",
                serde_json::to_string(&response_json)
                    .unwrap_or_else(|_| "Could not serialize".to_string())
            )));
        }

        let id = response_json
            .get("id")
            .and_then(|i| i.as_str())
            .map(|i| i.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(ModelReply {
            id,
            content,
            tool_calls,
        })
    }
}
