//! Tool backend contract
//!
//! Every tool backend client (HTTP tool server, in-process tool set, test
//! double) implements [`ToolBackend`]. The engine's tool orchestrator owns a
//! list of backends, builds its catalog from `list_tools` and forwards calls
//! through `call_tool`.

use async_trait::async_trait;
use serde_json::Value;

use crate::harmony::{ToolCall, ToolSpec};

/// Errors a backend client reports
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached (connection refused, DNS, ...)
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The backend did not answer in time
    #[error("Backend timed out")]
    Timeout,

    /// The backend ran the tool and reported an error
    #[error("Tool error: {0}")]
    Application(String),

    /// The backend rejected the call as malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The backend answered with something that is not the tool protocol
    #[error("Malformed backend response: {0}")]
    Protocol(String),
}

/// Trait that all tool backend clients must implement
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Stable identifier of the backend (used as the tool owner)
    fn id(&self) -> &str;

    /// Query the tools this backend exposes
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, BackendError>;

    /// Execute a tool call and return the raw result payload
    async fn call_tool(&self, call: &ToolCall) -> Result<Value, BackendError>;

    /// Reachability probe.
    /// Default implementation lists tools and reports whether that worked.
    async fn health(&self) -> bool {
        self.list_tools().await.is_ok()
    }
}
