//! Task Orchestrator
//!
//! Owns every task and drives each one through a bounded loop:
//!
//! 1. Check cancellation
//! 2. Fail closed at `max_iterations`
//! 3. Make sure the target endpoint is Running (wake and wait), then
//!    generate the next assistant message
//! 4. If the reply has no tool calls, complete with its text
//! 5. Otherwise run the tool calls in order, append their results as one
//!    `tool` message and go back to 1
//!
//! # Limits
//!
//! - `max_iterations` generation calls per task (default 20)
//! - `max_concurrent_tasks` loops executing at once (default 8)
//! - `max_consecutive_tool_failures` all-failed tool turns (default 3)
//!
//! Cancellation is cooperative: `stop_task` sets a flag that the loop
//! checks at the top of each iteration, after waking the endpoint and after
//! each generation call. In-flight network calls are never aborted.

pub mod queue;
pub mod task;

pub use queue::{enqueue_start, run_queue_consumer, InMemoryQueue, QueuedTask};
pub use task::{CreateTaskRequest, Priority, TaskCounts, TaskError, TaskSnapshot, TaskStatus};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sdk::errors::EngineError;
use sdk::harmony::{GenerationSettings, Message, ToolResult};
use sdk::types::ToolFailureKind;

use crate::config::OrchestratorConfig;
use crate::harmony::{validate_setting_ranges, validate_settings, ModelClient};
use crate::lifecycle::{EndpointStatus, LifecycleManager};
use crate::message_bus::{Event, MessageBus};
use crate::tools::ToolOrchestrator;

/// Aggregate view over tasks, endpoints and tools
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub tasks: TaskCounts,
    pub endpoints: Vec<EndpointStatus>,
    pub tool_catalog_size: usize,
    pub accepting_tasks: bool,
}

/// Outcome of [`TaskOrchestrator::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Loops that finished within the grace period
    pub drained: usize,
    /// Loops still running when the grace period ended; asked to stop
    pub cancelled: usize,
}

struct TaskEntry {
    snapshot: TaskSnapshot,
    seq: u64,
    cancel: Arc<AtomicBool>,
    status_tx: watch::Sender<TaskStatus>,
}

/// How a loop ended
enum Outcome {
    Completed(String),
    Stopped,
    Failed(EngineError),
}

struct Inner {
    config: OrchestratorConfig,
    endpoint_defaults: HashMap<String, GenerationSettings>,
    model: Arc<dyn ModelClient>,
    lifecycle: Arc<LifecycleManager>,
    tools: Arc<ToolOrchestrator>,
    bus: Arc<MessageBus>,
    tasks: RwLock<HashMap<String, TaskEntry>>,
    seq: AtomicU64,
    workers: Arc<Semaphore>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
}

/// Handle to the task orchestrator; cheap to clone
#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

impl TaskOrchestrator {
    /// `endpoint_defaults` maps each endpoint key tasks may target to the
    /// generation settings tasks on it start from.
    pub fn new(
        config: OrchestratorConfig,
        endpoint_defaults: HashMap<String, GenerationSettings>,
        model: Arc<dyn ModelClient>,
        lifecycle: Arc<LifecycleManager>,
        tools: Arc<ToolOrchestrator>,
        bus: Arc<MessageBus>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                endpoint_defaults,
                model,
                lifecycle,
                tools,
                bus,
                tasks: RwLock::new(HashMap::new()),
                seq: AtomicU64::new(0),
                workers,
                handles: StdMutex::new(Vec::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Create a task with the endpoint's default settings.
    pub async fn create_task(
        &self,
        title: &str,
        description: &str,
        target_model: &str,
        priority: Priority,
    ) -> Result<String, EngineError> {
        self.create_task_with_settings(
            CreateTaskRequest::new(title, description, target_model).with_priority(priority),
        )
        .await
    }

    /// Create a task in state Created. No network activity.
    ///
    /// The conversation starts with one user message holding the
    /// description.
    ///
    /// # Errors
    /// `Validation` on an empty title or description, an unknown endpoint
    /// key or out-of-range settings.
    pub async fn create_task_with_settings(
        &self,
        request: CreateTaskRequest,
    ) -> Result<String, EngineError> {
        let title = request.title.trim();
        let description = request.description.trim();
        if title.is_empty() {
            return Err(EngineError::Validation("title must not be empty".to_string()));
        }
        if description.is_empty() {
            return Err(EngineError::Validation(
                "description must not be empty".to_string(),
            ));
        }

        let defaults = self
            .inner
            .endpoint_defaults
            .get(&request.target_model)
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown endpoint '{}'", request.target_model))
            })?;

        let settings = match &request.settings {
            Some(overrides) => {
                validate_setting_ranges(overrides)?;
                defaults.overlay(overrides)
            }
            None => defaults.clone(),
        };
        validate_settings(&settings)?;

        let id = uuid::Uuid::new_v4().to_string();
        let snapshot = TaskSnapshot {
            id: id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            target_model: request.target_model.clone(),
            priority: request.priority,
            status: TaskStatus::Created,
            iterations: 0,
            settings,
            conversation: vec![Message::user(description)],
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let (status_tx, _) = watch::channel(TaskStatus::Created);
        let entry = TaskEntry {
            snapshot,
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            cancel: Arc::new(AtomicBool::new(false)),
            status_tx,
        };
        self.inner.write().insert(id.clone(), entry);

        info!(task_id = %id, endpoint = %request.target_model, priority = %request.priority, "Task created");
        self.inner
            .publish_status(&id, TaskStatus::Created, 0, None)
            .await;

        Ok(id)
    }

    /// Move a Created task to Running and hand its loop to the worker pool.
    ///
    /// # Errors
    /// `NotFound` for an unknown id; `Conflict` if the task is Running or
    /// already finished, or the orchestrator is shutting down.
    pub async fn start_task(&self, task_id: &str) -> Result<(), EngineError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::Conflict(
                "orchestrator is shutting down".to_string(),
            ));
        }

        {
            let mut tasks = self.inner.write();
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::NotFound(format!("task '{}'", task_id)))?;

            match entry.snapshot.status {
                TaskStatus::Created => {}
                TaskStatus::Running => {
                    return Err(EngineError::Conflict(format!(
                        "task '{}' is already running",
                        task_id
                    )));
                }
                status => {
                    return Err(EngineError::Conflict(format!(
                        "task '{}' already finished ({})",
                        task_id, status
                    )));
                }
            }

            entry.snapshot.status = TaskStatus::Running;
            entry.snapshot.started_at = Some(Utc::now());
            entry.status_tx.send_replace(TaskStatus::Running);
        }

        info!(task_id, "Task started");
        self.inner
            .publish_status(task_id, TaskStatus::Running, 0, None)
            .await;

        let inner = Arc::clone(&self.inner);
        let workers = Arc::clone(&self.inner.workers);
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    inner.finalize(&id, Outcome::Stopped).await;
                    return;
                }
            };
            let outcome = inner.run_loop(&id).await;
            inner.finalize(&id, outcome).await;
        });

        let mut handles = self.inner.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        Ok(())
    }

    /// Request cooperative cancellation.
    ///
    /// A no-op acknowledgement for finished tasks. For a task that has not
    /// started yet the request is remembered and honoured at its first
    /// checkpoint.
    pub fn stop_task(&self, task_id: &str) -> Result<(), EngineError> {
        let tasks = self.inner.read();
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task '{}'", task_id)))?;

        if entry.snapshot.status.is_terminal() {
            debug!(task_id, status = %entry.snapshot.status, "Stop on finished task ignored");
            return Ok(());
        }

        entry.cancel.store(true, Ordering::SeqCst);
        info!(task_id, "Stop requested");
        Ok(())
    }

    pub fn get_task_status(&self, task_id: &str) -> Result<TaskSnapshot, EngineError> {
        self.inner
            .read()
            .get(task_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| EngineError::NotFound(format!("task '{}'", task_id)))
    }

    /// Tasks in creation order, optionally filtered by status
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskSnapshot> {
        let tasks = self.inner.read();
        let mut entries: Vec<&TaskEntry> = tasks
            .values()
            .filter(|entry| status.map_or(true, |s| entry.snapshot.status == s))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|e| e.snapshot.clone()).collect()
    }

    pub fn get_system_stats(&self) -> SystemStats {
        let mut counts = TaskCounts::default();
        for entry in self.inner.read().values() {
            counts.add(entry.snapshot.status);
        }

        SystemStats {
            tasks: counts,
            endpoints: self.inner.lifecycle.statuses(),
            tool_catalog_size: self.inner.tools.catalog_size(),
            accepting_tasks: self.inner.accepting.load(Ordering::SeqCst),
        }
    }

    /// Remove a task that is not running.
    pub fn discard_task(&self, task_id: &str) -> Result<TaskSnapshot, EngineError> {
        let mut tasks = self.inner.write();
        match tasks.get(task_id).map(|e| e.snapshot.status) {
            None => Err(EngineError::NotFound(format!("task '{}'", task_id))),
            Some(TaskStatus::Running) => Err(EngineError::Conflict(format!(
                "task '{}' is running; stop it first",
                task_id
            ))),
            Some(_) => {
                let entry = tasks
                    .remove(task_id)
                    .ok_or_else(|| EngineError::NotFound(format!("task '{}'", task_id)))?;
                debug!(task_id, "Task discarded");
                Ok(entry.snapshot)
            }
        }
    }

    /// Wait until a task reaches a terminal status.
    ///
    /// # Errors
    /// `NotFound` for an unknown (or discarded) task,
    /// `ResourceUnavailable` if it is still unfinished after `timeout`.
    pub async fn wait_for_task(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskSnapshot, EngineError> {
        let mut rx = {
            let tasks = self.inner.read();
            let entry = tasks
                .get(task_id)
                .ok_or_else(|| EngineError::NotFound(format!("task '{}'", task_id)))?;
            entry.status_tx.subscribe()
        };

        let waited = tokio::time::timeout(timeout, rx.wait_for(|status| status.is_terminal()))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => self.get_task_status(task_id),
            Ok(Err(_)) => Err(EngineError::NotFound(format!("task '{}' was discarded", task_id))),
            Err(_) => Err(EngineError::ResourceUnavailable(format!(
                "task '{}' still running after {}s",
                task_id,
                timeout.as_secs_f64()
            ))),
        }
    }

    /// Whether new starts are accepted
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Refuse new starts, give running loops `grace` to finish, then ask
    /// the rest to stop.
    ///
    /// Cancelled loops get a second `grace` window to reach a checkpoint
    /// and finalize Stopped; loops still inside a network call after that
    /// are aborted and recorded as Stopped. No task is left Running.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let mut handles: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.handles.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        handles.retain(|h| !h.is_finished());
        let pending = handles.len();
        info!(pending, grace_secs = grace.as_secs_f64(), "Draining task loops");

        if tokio::time::timeout(grace, join_all(handles.iter_mut()))
            .await
            .is_ok()
        {
            return ShutdownReport {
                drained: pending,
                cancelled: 0,
            };
        }

        // Polling a completed handle again would panic
        handles.retain(|h| !h.is_finished());
        let still_running = handles.len();
        warn!(still_running, "Grace period over, cancelling remaining tasks");

        // Loops still waiting for a worker permit finalize Stopped at once
        self.inner.workers.close();
        for entry in self.inner.read().values() {
            if entry.snapshot.status == TaskStatus::Running {
                entry.cancel.store(true, Ordering::SeqCst);
            }
        }

        if tokio::time::timeout(grace, join_all(handles.iter_mut()))
            .await
            .is_err()
        {
            for handle in handles.iter().filter(|h| !h.is_finished()) {
                handle.abort();
            }
            let stranded: Vec<String> = self
                .inner
                .read()
                .iter()
                .filter(|(_, entry)| entry.snapshot.status == TaskStatus::Running)
                .map(|(id, _)| id.clone())
                .collect();
            for task_id in stranded {
                warn!(task_id = %task_id, "Task loop did not reach a checkpoint, aborted");
                self.inner.finalize(&task_id, Outcome::Stopped).await;
            }
        }

        ShutdownReport {
            drained: pending - still_running,
            cancelled: still_running,
        }
    }

    pub fn tools(&self) -> &Arc<ToolOrchestrator> {
        &self.inner.tools
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.inner.lifecycle
    }
}

impl Inner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.write().unwrap_or_else(|p| p.into_inner())
    }

    async fn publish_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        iterations: u32,
        error: Option<String>,
    ) {
        self.bus
            .publish(Event::TaskStatusChanged {
                task_id: task_id.to_string(),
                status,
                iterations,
                error,
            })
            .await;
    }

    fn cancelled(&self, cancel: &AtomicBool) -> bool {
        cancel.load(Ordering::SeqCst)
    }

    /// Append to the conversation; false if the task vanished
    fn append(&self, task_id: &str, message: Message) -> bool {
        match self.write().get_mut(task_id) {
            Some(entry) => {
                entry.snapshot.conversation.push(message);
                true
            }
            None => false,
        }
    }

    async fn run_loop(&self, task_id: &str) -> Outcome {
        let (endpoint, settings, cancel) = {
            let tasks = self.read();
            let Some(entry) = tasks.get(task_id) else {
                return Outcome::Failed(EngineError::NotFound(format!("task '{}'", task_id)));
            };
            (
                entry.snapshot.target_model.clone(),
                entry.snapshot.settings.clone(),
                Arc::clone(&entry.cancel),
            )
        };

        let max_iterations = self.config.max_iterations;
        let mut consecutive_tool_failures = 0u32;

        loop {
            // Checkpoint: loop top
            if self.cancelled(&cancel) {
                return Outcome::Stopped;
            }

            let (iterations, conversation) = {
                let tasks = self.read();
                let Some(entry) = tasks.get(task_id) else {
                    return Outcome::Stopped;
                };
                (entry.snapshot.iterations, entry.snapshot.conversation.clone())
            };

            // Before waking, so an exhausted task never causes a cold start
            if iterations >= max_iterations {
                error!(task_id, iterations, "Task exceeded max iterations");
                return Outcome::Failed(EngineError::IterationLimitExceeded(iterations));
            }

            if let Err(e) = self
                .lifecycle
                .ensure_running(&endpoint, self.config.wake_timeout())
                .await
            {
                return Outcome::Failed(e);
            }

            // Checkpoint: after the wake wait
            if self.cancelled(&cancel) {
                return Outcome::Stopped;
            }

            debug!(task_id, iteration = iterations + 1, max_iterations, "Generating");
            let tools = self.tools.get_all_tools();
            let reply = {
                let _lease = match self.lifecycle.lease(&endpoint).await {
                    Ok(lease) => lease,
                    Err(e) => return Outcome::Failed(e),
                };
                self.model
                    .generate(&endpoint, &conversation, &tools, &settings)
                    .await
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    error!(task_id, "Generation failed: {}", e);
                    return Outcome::Failed(e);
                }
            };

            let iterations = {
                let mut tasks = self.write();
                let Some(entry) = tasks.get_mut(task_id) else {
                    return Outcome::Stopped;
                };
                entry.snapshot.iterations += 1;
                entry.snapshot.iterations
            };

            // Checkpoint: after the generation call; the reply is discarded
            if self.cancelled(&cancel) {
                debug!(task_id, "Stop observed during generation, discarding reply");
                return Outcome::Stopped;
            }

            let calls: Vec<_> = reply.tool_calls().into_iter().cloned().collect();
            let mut ids = HashSet::new();
            if let Some(dup) = calls.iter().find(|c| !ids.insert(c.id.as_str())) {
                return Outcome::Failed(EngineError::Validation(format!(
                    "duplicate tool_call id '{}' in one turn",
                    dup.id
                )));
            }

            let text = reply.text();
            if !self.append(task_id, reply) {
                return Outcome::Stopped;
            }

            if calls.is_empty() {
                info!(task_id, iterations, "Task produced a final answer");
                return Outcome::Completed(text);
            }

            let mut results: Vec<ToolResult> = Vec::with_capacity(calls.len());
            let mut failures = 0usize;
            let mut last_failure = None;
            let mut validation_failure = None;

            for call in &calls {
                debug!(task_id, tool = %call.name, tool_call_id = %call.id, "Executing tool");
                let response = self.tools.execute(call).await;

                self.bus
                    .publish(Event::ToolExecuted {
                        task_id: task_id.to_string(),
                        tool: call.name.clone(),
                        tool_call_id: call.id.clone(),
                        success: response.success,
                    })
                    .await;

                if let Some(failure) = &response.error {
                    failures += 1;
                    if failure.kind == ToolFailureKind::Validation {
                        validation_failure = Some(failure.clone());
                    }
                    last_failure = Some(failure.clone());
                }
                results.push(response.into_tool_result());
            }

            if !self.append(task_id, Message::tool_results(results)) {
                return Outcome::Stopped;
            }

            if let Some(failure) = validation_failure {
                warn!(task_id, "Tool rejected its arguments: {}", failure);
                return Outcome::Failed(EngineError::Validation(failure.to_string()));
            }

            if failures == calls.len() {
                consecutive_tool_failures += 1;
                warn!(
                    task_id,
                    consecutive_tool_failures, "Every tool call of this turn failed"
                );
                if consecutive_tool_failures >= self.config.max_consecutive_tool_failures {
                    let last = last_failure
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "unknown tool error".to_string());
                    return Outcome::Failed(EngineError::permanent(format!(
                        "tool calls failed in {} consecutive turns; last error: {}",
                        consecutive_tool_failures, last
                    )));
                }
            } else {
                consecutive_tool_failures = 0;
            }
        }
    }

    async fn finalize(&self, task_id: &str, outcome: Outcome) {
        let (status, iterations, error) = {
            let mut tasks = self.write();
            let Some(entry) = tasks.get_mut(task_id) else {
                warn!(task_id, "Finished task no longer exists");
                return;
            };
            if entry.snapshot.status.is_terminal() {
                debug!(task_id, status = %entry.snapshot.status, "Task already finalized");
                return;
            }

            let snapshot = &mut entry.snapshot;
            match outcome {
                Outcome::Completed(result) => {
                    snapshot.status = TaskStatus::Completed;
                    snapshot.result = Some(result);
                }
                Outcome::Stopped | Outcome::Failed(EngineError::Cancelled) => {
                    snapshot.status = TaskStatus::Stopped;
                }
                Outcome::Failed(e) => {
                    snapshot.status = TaskStatus::Failed;
                    snapshot.error = Some(TaskError::from(&e));
                }
            }
            snapshot.finished_at = Some(Utc::now());
            entry.status_tx.send_replace(snapshot.status);

            (
                snapshot.status,
                snapshot.iterations,
                snapshot.error.as_ref().map(|e| e.message.clone()),
            )
        };

        match &error {
            Some(message) => warn!(task_id, %status, iterations, "Task finished: {}", message),
            None => info!(task_id, %status, iterations, "Task finished"),
        }
        self.publish_status(task_id, status, iterations, error).await;
    }
}
