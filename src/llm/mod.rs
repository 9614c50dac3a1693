//! LLM interface for answer synthesis
//!
//! The generator is external; this module defines the flat request/response
//! records, an OpenAI-compatible HTTP client, and deterministic test doubles.
//! `raw` is always JSON-serializable for traceability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    #[error("LLM response malformed: {0}")]
    MalformedResponse(String),

    #[error("LLM unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Generator output. `raw` carries the provider response verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub raw: Value,
}

/// Text generator interface
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        max_output_tokens: u32,
    ) -> Result<Generation, LlmError>;

    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat-completions client
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: Option<&Value>,
        max_output_tokens: u32,
    ) -> Result<Generation, LlmError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_output_tokens,
        });
        if let Some(tools) = tools {
            body["tools"] = tools.clone();
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::RequestFailed(format!(
                "status {}",
                response.status()
            )));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        let message = raw
            .pointer("/choices/0/message")
            .ok_or_else(|| LlmError::MalformedResponse("missing choices[0].message".to_string()))?;

        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let function = call.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let arguments = function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .and_then(|s| serde_json::from_str(s).ok())
                            .unwrap_or(Value::Null);
                        Some(ToolCall { name, arguments })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Generation {
            text,
            tool_calls,
            raw,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Deterministic test double that replays scripted responses, with optional
/// per-call latency for budget tests
pub struct ScriptedLlm {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    latency: Option<std::time::Duration>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&Value>,
        _max_output_tokens: u32,
    ) -> Result<Generation, LlmError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let text = self
            .responses
            .lock()
            .expect("scripted llm lock")
            .pop_front()
            .ok_or_else(|| LlmError::Unavailable("script exhausted".to_string()))?;

        Ok(Generation {
            text,
            tool_calls: Vec::new(),
            raw: serde_json::json!({"mock": true}),
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
