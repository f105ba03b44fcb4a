//! Orca SDK
//!
//! Shared library providing the harmony message schema, the error taxonomy and
//! the contracts that tool backends and queue collaborators implement.
//! This crate is used by the engine and by anything that talks to it.

/// Tool backend contract
pub mod backend;

/// Error types and handling
pub mod errors;

/// Harmony message schema
pub mod harmony;

/// Queue and pub/sub contracts
pub mod queue;

/// Tool execution request/response types
pub mod types;

// Re-export commonly used types
pub use backend::{BackendError, ToolBackend};
pub use errors::{EngineError, ErrorKind, OrcaErrorExt};
pub use harmony::{Content, GenerationSettings, Message, Role, ToolCall, ToolResult, ToolSpec};
pub use queue::{StatusPublisher, TaskQueue};
pub use types::{ToolExecutionResponse, ToolFailure, ToolFailureKind};
