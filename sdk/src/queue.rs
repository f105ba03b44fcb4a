//! Queue and pub/sub contracts
//!
//! Decoupled deployments route task execution through an external queue and
//! publish status changes for real-time observers. The engine only depends on
//! these contracts; a Redis-backed (or any other) implementation lives with
//! the collaborator that provides it. Payloads are opaque JSON strings.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::EngineError;

/// Work queue with blocking pop
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Push a payload onto the queue named `key`
    async fn enqueue(&self, key: &str, payload: String) -> Result<(), EngineError>;

    /// Pop the oldest payload, waiting up to `timeout`.
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn dequeue(&self, key: &str, timeout: Duration) -> Result<Option<String>, EngineError>;
}

/// Fire-and-forget status publication
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), EngineError>;
}
