//! Task records and their public views

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use sdk::errors::{EngineError, ErrorKind};
use sdk::harmony::{GenerationSettings, Message};

use crate::secrets::scrub;

/// Task lifecycle status
///
/// `Created -> Running -> {Completed, Failed, Stopped}`. Terminal states
/// are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Stopped | TaskStatus::Completed | TaskStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(TaskStatus::Created),
            "running" => Ok(TaskStatus::Running),
            "stopped" => Ok(TaskStatus::Stopped),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(EngineError::Validation(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

/// Task priority (informational; the worker pool is FIFO)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(EngineError::Validation(format!(
                "unknown priority '{}'",
                other
            ))),
        }
    }
}

/// Why a task failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for TaskError {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: scrub(&err.to_string()),
        }
    }
}

/// Request to create a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    /// Endpoint key (e.g. "20b", "120b")
    pub target_model: String,
    #[serde(default)]
    pub priority: Priority,
    /// Overrides layered on the endpoint's default settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<GenerationSettings>,
}

impl CreateTaskRequest {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        target_model: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            target_model: target_model.into(),
            priority: Priority::default(),
            settings: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

/// Point-in-time copy of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub title: String,
    pub description: String,
    pub target_model: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub iterations: u32,
    pub settings: GenerationSettings,
    pub conversation: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Task counts per status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskCounts {
    pub created: usize,
    pub running: usize,
    pub stopped: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Created => self.created += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Stopped => self.stopped += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
        self.total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Created.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Stopped.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_parse_status_and_priority() {
        assert_eq!("Running".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert!("paused".parse::<TaskStatus>().is_err());
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: CreateTaskRequest = serde_json::from_str(
            r#"{"title":"Summarize","description":"Summarize this","target_model":"120b"}"#,
        )
        .unwrap();
        assert_eq!(req.priority, Priority::Normal);
        assert!(req.settings.is_none());
    }

    #[test]
    fn test_task_error_is_scrubbed() {
        let err = EngineError::permanent("401 for Bearer abcdefghijklmnopqrstuvwxyz012345");
        let task_error = TaskError::from(&err);
        assert_eq!(task_error.kind, ErrorKind::Upstream);
        assert!(task_error.message.contains("[REDACTED]"));
    }

    #[test]
    fn test_counts() {
        let mut counts = TaskCounts::default();
        counts.add(TaskStatus::Completed);
        counts.add(TaskStatus::Completed);
        counts.add(TaskStatus::Failed);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.total, 3);
    }
}
