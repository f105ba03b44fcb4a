//! Queue-driven task starts
//!
//! Decoupled deployments push `{"task_id": "..."}` onto a work queue; the
//! consumer pops entries and starts the referenced task. [`InMemoryQueue`]
//! backs single-process runs and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sdk::errors::EngineError;
use sdk::queue::TaskQueue;

use super::TaskOrchestrator;

/// How long one blocking pop waits before the shutdown flag is rechecked
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Queue entry asking for a task start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: String,
}

/// Process-local FIFO queues keyed by name
#[derive(Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, key: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    fn pop(&self, key: &str) -> Option<String> {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(key)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, key: &str, payload: String) -> Result<(), EngineError> {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, key: &str, timeout: Duration) -> Result<Option<String>, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.pop(key) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.pop(key));
            }
        }
    }
}

/// Push a start request for `task_id` onto the queue named `key`.
pub async fn enqueue_start(
    queue: &dyn TaskQueue,
    key: &str,
    task_id: &str,
) -> Result<(), EngineError> {
    let payload = serde_json::to_string(&QueuedTask {
        task_id: task_id.to_string(),
    })
    .map_err(|e| EngineError::Validation(format!("unserializable queue entry: {}", e)))?;
    queue.enqueue(key, payload).await
}

/// Pop start requests from `key` until `shutdown` is set.
///
/// Malformed entries and start failures are logged and skipped; the
/// consumer itself never stops on a bad entry.
pub fn run_queue_consumer(
    orchestrator: TaskOrchestrator,
    queue: Arc<dyn TaskQueue>,
    key: String,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(queue = %key, "Queue consumer started");
        while !shutdown.load(Ordering::SeqCst) {
            let payload = match queue.dequeue(&key, DEQUEUE_TIMEOUT).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(queue = %key, "Dequeue failed: {}", e);
                    tokio::time::sleep(DEQUEUE_TIMEOUT).await;
                    continue;
                }
            };

            let entry: QueuedTask = match serde_json::from_str(&payload) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(queue = %key, "Skipping malformed queue entry: {}", e);
                    continue;
                }
            };

            match orchestrator.start_task(&entry.task_id).await {
                Ok(()) => debug!(task_id = %entry.task_id, "Started task from queue"),
                Err(e) => warn!(task_id = %entry.task_id, "Queued start rejected: {}", e),
            }
        }
        info!(queue = %key, "Queue consumer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryQueue::new();
        queue.enqueue("q", "a".to_string()).await.unwrap();
        queue.enqueue("q", "b".to_string()).await.unwrap();
        assert_eq!(queue.len("q"), 2);

        let first = queue.dequeue("q", Duration::from_millis(10)).await.unwrap();
        let second = queue.dequeue("q", Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
        assert!(queue.is_empty("q"));
    }

    #[tokio::test]
    async fn test_dequeue_times_out_empty() {
        let queue = InMemoryQueue::new();
        let got = queue.dequeue("q", Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryQueue::new());
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.enqueue("q", "late".to_string()).await.unwrap();
        });

        let got = queue.dequeue("q", Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_enqueue_start_payload() {
        let queue = InMemoryQueue::new();
        enqueue_start(&queue, "orca:tasks", "t-1").await.unwrap();
        let raw = queue
            .dequeue("orca:tasks", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let entry: QueuedTask = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.task_id, "t-1");
    }
}
