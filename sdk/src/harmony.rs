//! Harmony message schema
//!
//! The structured Message/Content document exchanged with model endpoints.
//! `Content` is a closed tagged union: the `type` field selects exactly one
//! variant and fields that do not apply to that variant are absent on the
//! wire rather than null-filled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::errors::ErrorKind;
use crate::types::ToolFailure;

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message
    User,

    /// Assistant message
    Assistant,

    /// Tool result message
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool call request emitted by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique identifier for this tool call
    pub id: String,

    /// Name of the tool to call
    pub name: String,

    /// Arguments to pass to the tool
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Create a new tool call
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of a tool call, correlated to the call by `tool_call_id`
///
/// Exactly one of `result` or `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolResult {
    /// Successful tool result
    pub fn success(tool_call_id: impl Into<String>, result: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Failed tool result
    pub fn failure(tool_call_id: impl Into<String>, error: ToolFailure) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A single content block of a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Plain text
    Text { text: String },

    /// Reference to an image hosted elsewhere
    ImageReference {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },

    /// The model asks for a tool to be executed
    ToolCall(ToolCall),

    /// Result of a previously requested tool call
    ToolResult(ToolResult),

    /// An error surfaced inside the conversation
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    /// Wire discriminant of this block
    pub fn type_name(&self) -> &'static str {
        match self {
            Content::Text { .. } => "text",
            Content::ImageReference { .. } => "image_reference",
            Content::ToolCall(_) => "tool_call",
            Content::ToolResult(_) => "tool_result",
            Content::Error { .. } => "error",
        }
    }
}

/// Message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,

    pub role: Role,

    pub content: Vec<Content>,

    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id and the current time
    pub fn new(role: Role, content: Vec<Content>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            role,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message with a single text block
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Content::text(text)])
    }

    /// Create a new assistant message
    pub fn assistant(content: Vec<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool message carrying the results of one assistant turn
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self::new(
            Role::Tool,
            results.into_iter().map(Content::ToolResult).collect(),
        )
    }

    /// Tool calls in declaration order
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::ToolCall(call) => Some(call),
                Content::Text { .. }
                | Content::ImageReference { .. }
                | Content::ToolResult(_)
                | Content::Error { .. } => None,
            })
            .collect()
    }

    /// Concatenated text blocks
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            match block {
                Content::Text { text } => out.push_str(text),
                Content::ImageReference { .. }
                | Content::ToolCall(_)
                | Content::ToolResult(_)
                | Content::Error { .. } => {}
            }
        }
        out
    }
}

/// Per-call generation configuration
///
/// Only `model` is required. Unset fields are omitted from the request so the
/// endpoint applies its own defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GenerationSettings {
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Layer `overrides` on top of `self`; set fields in `overrides` win.
    pub fn overlay(&self, overrides: &GenerationSettings) -> GenerationSettings {
        GenerationSettings {
            model: if overrides.model.is_empty() {
                self.model.clone()
            } else {
                overrides.model.clone()
            },
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            top_k: overrides.top_k.or(self.top_k),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            presence_penalty: overrides.presence_penalty.or(self.presence_penalty),
            frequency_penalty: overrides.frequency_penalty.or(self.frequency_penalty),
            seed: overrides.seed.or(self.seed),
        }
    }
}

/// A tool advertised by a backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON schema of the arguments object
    #[serde(default = "empty_schema")]
    pub parameters: Value,

    /// Id of the backend that declared the tool, assigned at catalog load
    #[serde(default)]
    pub backend: String,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}
