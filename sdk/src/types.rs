//! Tool execution request/response types
//!
//! A tool execution request is a [`ToolCall`](crate::harmony::ToolCall)
//! (`{name, arguments, id}`). The response is `{success, tool_call_id,
//! result | error}` and always carries the id of the call it answers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::harmony::{Content, ToolResult};

/// Why a tool call failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    /// No backend declares the tool
    NotFound,

    /// More than one backend declares the tool
    Conflict,

    /// The backend did not answer within the per-call timeout
    Timeout,

    /// The backend could not be reached
    Unreachable,

    /// The backend ran the tool and reported an error
    Application,

    /// The call or its arguments were rejected as malformed
    Validation,
}

impl fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolFailureKind::NotFound => "not_found",
            ToolFailureKind::Conflict => "conflict",
            ToolFailureKind::Timeout => "timeout",
            ToolFailureKind::Unreachable => "unreachable",
            ToolFailureKind::Application => "application",
            ToolFailureKind::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// Structured tool error payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: ToolFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Output of a tool execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolExecutionResponse {
    pub success: bool,

    pub tool_call_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolExecutionResponse {
    /// Create a successful response carrying the raw backend payload
    pub fn ok(tool_call_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            success: true,
            tool_call_id: tool_call_id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn failed(
        tool_call_id: impl Into<String>,
        kind: ToolFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            tool_call_id: tool_call_id.into(),
            result: None,
            error: Some(ToolFailure::new(kind, message)),
        }
    }

    /// Convert into the `tool_result` block fed back to the model
    pub fn into_tool_result(self) -> ToolResult {
        match self.error {
            Some(error) => ToolResult::failure(self.tool_call_id, error),
            None => ToolResult::success(
                self.tool_call_id,
                self.result.unwrap_or(serde_json::Value::Null),
            ),
        }
    }

    pub fn into_content(self) -> Content {
        Content::ToolResult(self.into_tool_result())
    }
}
