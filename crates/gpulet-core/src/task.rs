//! Task model and lifecycle types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A submitted script execution request, tracked through its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned at submission
    pub id: Uuid,
    /// Path to the script to execute
    pub script_path: PathBuf,
    /// Script type detected at submission
    pub script_type: ScriptType,
    /// Number of GPU devices the task needs (0 = run unbound)
    pub requested_gpus: u32,
    /// Device indices named by the script text, used as the reservation
    /// preference; empty when the script names none
    pub preferred_gpus: Vec<u32>,
    /// Devices currently reserved for the task; empty unless running
    pub assigned_gpus: Vec<u32>,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Wall-clock timeout for the child process
    pub timeout_secs: u64,
    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
    /// Set when the task transitions to Running
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Child exit code, when it exited normally
    pub exit_code: Option<i32>,
    /// Bounded head of the child's combined output
    pub output_head: String,
    /// Failure diagnostic, when the task did not succeed
    pub error_message: Option<String>,
}

impl Task {
    /// Create a new pending task
    pub fn new(
        script_path: PathBuf,
        script_type: ScriptType,
        requested_gpus: u32,
        preferred_gpus: Vec<u32>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            script_path,
            script_type,
            requested_gpus,
            preferred_gpus,
            assigned_gpus: Vec::new(),
            status: TaskStatus::Pending,
            timeout_secs,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            output_head: String::new(),
            error_message: None,
        }
    }

    /// Transition to Running with the reserved devices
    pub fn mark_running(&mut self, devices: Vec<u32>) {
        self.assigned_gpus = devices;
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition to a terminal status, clearing the device assignment
    pub fn mark_finished(&mut self, status: TaskStatus) {
        debug_assert!(status.is_terminal());
        self.assigned_gpus.clear();
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Whether the task has reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the queue for devices
    Pending,
    /// Child process is executing
    Running,
    /// Child exited with code 0
    Success,
    /// Child exited nonzero, died on a signal, or never spawned
    Failed,
    /// Child exceeded its wall-clock timeout and was killed
    Timeout,
    /// Cancelled before or during execution
    Cancelled,
}

impl TaskStatus {
    /// Whether this status ends the task's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "Pending"),
            TaskStatus::Running => write!(f, "Running"),
            TaskStatus::Success => write!(f, "Success"),
            TaskStatus::Failed => write!(f, "Failed"),
            TaskStatus::Timeout => write!(f, "Timeout"),
            TaskStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Script language detected from the path and first line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Python,
    Shell,
    Unknown,
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptType::Python => write!(f, "python"),
            ScriptType::Shell => write!(f, "shell"),
            ScriptType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Parameters for submitting a script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Path to the script file
    pub script_path: PathBuf,
    /// Caller-requested device count; overridden by devices the script
    /// itself names, used as-is otherwise
    #[serde(default)]
    pub gpu_count: Option<u32>,
    /// Per-task timeout override
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SubmitRequest {
    /// Create a request with defaults for count and timeout
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            gpu_count: None,
            timeout_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = Task::new(
            PathBuf::from("/tmp/train.py"),
            ScriptType::Python,
            2,
            vec![0, 1],
            3600,
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.requested_gpus, 2);
        assert!(task.assigned_gpus.is_empty());
        assert!(task.started_at.is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_task_transitions() {
        let mut task = Task::new(
            PathBuf::from("job.sh"),
            ScriptType::Shell,
            1,
            Vec::new(),
            60,
        );

        task.mark_running(vec![3]);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.assigned_gpus, vec![3]);
        assert!(task.started_at.is_some());

        task.mark_finished(TaskStatus::Success);
        assert!(task.is_terminal());
        assert!(task.assigned_gpus.is_empty());
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&TaskStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let back: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, TaskStatus::Cancelled);
    }
}
