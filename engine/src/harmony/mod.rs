//! Harmony Protocol Client
//!
//! Validates Harmony documents and performs generation calls against model
//! endpoints. The orchestrator talks to endpoints only through the
//! [`ModelClient`] trait so the execution loop can be driven by a scripted
//! client in tests.

use async_trait::async_trait;

use sdk::errors::EngineError;
use sdk::harmony::{GenerationSettings, Message, ToolSpec};

use crate::secrets::scrub;

pub mod client;
pub mod validate;

pub use client::{EndpointTarget, HarmonyClient};
pub use validate::{
    check_tool_correlation, check_unique_tool_call_ids, is_valid_tool_name, parse_settings,
    validate_content, validate_conversation, validate_message, validate_setting_ranges,
    validate_settings, validate_tools,
};

/// Result type for Harmony operations
pub type Result<T> = std::result::Result<T, HarmonyError>;

/// Errors that can occur during Harmony operations
#[derive(Debug, thiserror::Error)]
pub enum HarmonyError {
    #[error("{0}")]
    Validation(String),

    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// Connect failure or retryable HTTP status
    #[error("Endpoint unavailable: {0}")]
    Transient(String),

    #[error("Generation request timed out")]
    Timeout,

    /// Non-retryable HTTP status
    #[error("Endpoint rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Reply is not a valid Harmony message
    #[error("Malformed reply: {0}")]
    Parse(String),
}

impl HarmonyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HarmonyError::Transient(_) | HarmonyError::Timeout)
    }
}

impl From<HarmonyError> for EngineError {
    fn from(err: HarmonyError) -> Self {
        match err {
            HarmonyError::Validation(msg) => EngineError::Validation(msg),
            HarmonyError::UnknownEndpoint(key) => {
                EngineError::NotFound(format!("endpoint '{}'", key))
            }
            e @ (HarmonyError::Transient(_) | HarmonyError::Timeout) => {
                EngineError::transient(scrub(&e.to_string()))
            }
            e @ (HarmonyError::Rejected { .. } | HarmonyError::Parse(_)) => {
                EngineError::permanent(scrub(&e.to_string()))
            }
        }
    }
}

/// Generation surface the task loop depends on
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generate the next assistant message for `conversation`.
    async fn generate(
        &self,
        endpoint_key: &str,
        conversation: &[Message],
        tools: &[ToolSpec],
        settings: &GenerationSettings,
    ) -> std::result::Result<Message, EngineError>;

    /// Liveness probe; never touches lifecycle state
    async fn is_model_available(&self, endpoint_key: &str) -> bool;
}
