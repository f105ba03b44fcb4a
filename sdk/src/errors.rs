//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the Orca engine.
//! All errors implement the `OrcaErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Error Categories
//!
//! - **Validation**: malformed message, tool call or settings payload. Always
//!   rejected before any network call is made.
//! - **NotFound**: unknown task, tool, tool backend or endpoint
//! - **Conflict**: duplicate start, ambiguous tool name
//! - **Upstream**: model or tool backend failure, either transient
//!   (retryable) or permanent
//! - **ResourceUnavailable**: an endpoint did not reach Running in time
//! - **IterationLimitExceeded**: a task hit its generate/tool round-trip cap
//! - **Cancelled**: cooperative cancellation was observed
//!
//! Task records keep the [`ErrorKind`] discriminant next to the message so
//! failures stay inspectable after the error value itself is gone.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Trait for Orca error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait OrcaErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and never contains
    /// credentials or raw upstream payloads.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require a configuration change.
    fn is_recoverable(&self) -> bool;
}

/// Discriminant of an [`EngineError`], stored in task records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Upstream,
    ResourceUnavailable,
    IterationLimitExceeded,
    Cancelled,
    Config,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Upstream => "upstream",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::IterationLimitExceeded => "iteration_limit_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorKind, OrcaErrorExt};
///
/// let error = EngineError::transient("endpoint returned 503");
/// assert_eq!(error.kind(), ErrorKind::Upstream);
/// assert!(error.is_retryable());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::Config("no endpoints configured".to_string());
/// assert!(!fatal.is_recoverable());
/// println!("Hint: {}", fatal.user_hint());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Payload errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // Model / tool backend / endpoint provider errors
    #[error("Upstream error: {message}")]
    Upstream { message: String, retryable: bool },

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    // Execution loop errors
    #[error("Iteration limit exceeded after {0} iterations")]
    IterationLimitExceeded(u32),

    #[error("Cancelled")]
    Cancelled,

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Build a retryable upstream error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            retryable: true,
        }
    }

    /// Build a non-retryable upstream error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            retryable: false,
        }
    }

    /// The discriminant recorded alongside failed tasks
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            Self::IterationLimitExceeded(_) => ErrorKind::IterationLimitExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether a retry of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream {
                retryable: true,
                ..
            }
        )
    }
}

impl OrcaErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Validation(_) => "The request payload is malformed. Fix it and resubmit",
            Self::NotFound(_) => "The requested task, tool or endpoint does not exist",
            Self::Conflict(_) => "The operation conflicts with the current state",
            Self::Upstream {
                retryable: true, ..
            } => "A backend is temporarily failing. Try again shortly",
            Self::Upstream { .. } => "A backend rejected the request",
            Self::ResourceUnavailable(_) => {
                "The model endpoint did not start in time. Try again once it is warm"
            }
            Self::IterationLimitExceeded(_) => {
                "Task too complex. Try breaking it into smaller steps"
            }
            Self::Cancelled => "The task was stopped",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_)
            | Self::Upstream {
                retryable: false, ..
            } => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
