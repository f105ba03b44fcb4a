//! Orca Engine Library
//!
//! Core of the orca orchestrator: task loop, endpoint lifecycle, tool
//! routing and the Harmony client. Used by the binary and integration tests.

/// Configuration management module
pub mod config;

/// Secret management module
pub mod secrets;

/// Retry with exponential backoff
pub mod retry;

/// Message bus for status events
pub mod message_bus;

/// Harmony protocol client
pub mod harmony;

/// Endpoint lifecycle manager
pub mod lifecycle;

/// Tool catalog and routing
pub mod tools;

/// Task orchestrator
pub mod orchestrator;

/// Telemetry and Observability
pub mod telemetry;

/// Process context and graceful shutdown
pub mod daemon;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
