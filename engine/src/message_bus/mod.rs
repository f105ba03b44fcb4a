//! Message Bus for status events
//!
//! Components publish task and endpoint status changes here; the CLI, the
//! queue consumer and an optional external [`StatusPublisher`] subscribe.
//! Channels are bounded and publishing never waits on a slow subscriber:
//! an event that does not fit is dropped for that subscriber only.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use sdk::queue::StatusPublisher;

use crate::lifecycle::EndpointState;
use crate::orchestrator::TaskStatus;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Event types that can be subscribed to
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    TaskStatusChanged,
    EndpointStateChanged,
    ToolExecuted,
    CatalogLoaded,
    DaemonStarted,
    DaemonStopping,
    /// Subscribe to all event types
    All,
}

/// Events published on the message bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A task moved to a new status
    TaskStatusChanged {
        task_id: String,
        status: TaskStatus,
        iterations: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An endpoint moved to a new lifecycle state
    EndpointStateChanged {
        key: String,
        from: EndpointState,
        to: EndpointState,
    },
    /// A tool call finished, successfully or not
    ToolExecuted {
        task_id: String,
        tool: String,
        tool_call_id: String,
        success: bool,
    },
    /// The tool catalog was (re)built
    CatalogLoaded { tools: usize, backends: usize },
    DaemonStarted,
    DaemonStopping,
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TaskStatusChanged { .. } => EventType::TaskStatusChanged,
            Event::EndpointStateChanged { .. } => EventType::EndpointStateChanged,
            Event::ToolExecuted { .. } => EventType::ToolExecuted,
            Event::CatalogLoaded { .. } => EventType::CatalogLoaded,
            Event::DaemonStarted => EventType::DaemonStarted,
            Event::DaemonStopping => EventType::DaemonStopping,
        }
    }

    /// External pub/sub channel for task events
    pub fn channel(&self) -> Option<String> {
        match self {
            Event::TaskStatusChanged { task_id, .. } | Event::ToolExecuted { task_id, .. } => {
                Some(format!("orca:task:{}", task_id))
            }
            Event::EndpointStateChanged { key, .. } => Some(format!("orca:endpoint:{}", key)),
            Event::CatalogLoaded { .. } | Event::DaemonStarted | Event::DaemonStopping => None,
        }
    }
}

/// Message bus for pub/sub communication between components
pub struct MessageBus {
    /// Subscribers per event type, each with a bounded channel
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to subscribers of its type and of `EventType::All`.
    ///
    /// Closed subscribers are pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(?event_type, "Subscriber lagging, event dropped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscribers for an event type
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        let channels = self.channels.lock().await;
        channels
            .get(&event_type)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Drop every subscriber. Each receiver ends once it has drained the
    /// events already delivered to it.
    pub async fn close(&self) {
        self.channels.lock().await.clear();
    }

    /// Forward every event with a channel to an external publisher.
    ///
    /// Runs until the bus is closed or dropped. Publisher failures are logged and
    /// never reach the component that produced the event.
    pub async fn spawn_forwarder(
        &self,
        publisher: Arc<dyn StatusPublisher>,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe(EventType::All).await;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(channel) = event.channel() else {
                    continue;
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = publisher.publish(&channel, payload).await {
                    tracing::warn!(channel = %channel, "Status publish failed: {}", e);
                }
            }
        })
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
