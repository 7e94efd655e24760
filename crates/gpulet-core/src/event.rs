//! Task lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::ScriptType;

/// One lifecycle transition of a task, emitted on the event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task the event belongs to
    pub task_id: Uuid,
    /// Script type of the task
    pub script_type: ScriptType,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// The transition itself
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    /// Create an event stamped with the current time
    pub fn new(task_id: Uuid, script_type: ScriptType, kind: TaskEventKind) -> Self {
        Self {
            task_id,
            script_type,
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Lifecycle transitions a task goes through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventKind {
    /// Task accepted into the queue
    Submitted {
        /// Devices the task will wait for
        requested_gpus: u32,
    },
    /// Devices reserved for the task
    GpuAssigned {
        /// Reserved device indices
        devices: Vec<u32>,
    },
    /// Task handed to the execution supervisor
    ExecutionStarted,
    /// Child process spawned
    ProcessStarted {
        /// OS process id of the child
        pid: u32,
    },
    /// Child exited with code 0
    ExecutionSuccess {
        exit_code: i32,
        elapsed_secs: f64,
    },
    /// Child exited nonzero, died on a signal, or never spawned
    ExecutionFailed {
        exit_code: Option<i32>,
        error: String,
    },
    /// Child exceeded its wall-clock timeout and was killed
    ExecutionTimeout {
        timeout_secs: u64,
    },
    /// Task cancelled before or during execution
    ExecutionCancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_names() {
        let event = TaskEvent::new(
            Uuid::nil(),
            ScriptType::Python,
            TaskEventKind::GpuAssigned { devices: vec![0, 1] },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"GPU_ASSIGNED\""));
        assert!(json.contains("\"devices\":[0,1]"));

        let json = serde_json::to_string(&TaskEvent::new(
            Uuid::nil(),
            ScriptType::Shell,
            TaskEventKind::ExecutionTimeout { timeout_secs: 60 },
        ))
        .unwrap();
        assert!(json.contains("\"event\":\"EXECUTION_TIMEOUT\""));
    }

    #[test]
    fn test_event_round_trip() {
        let event = TaskEvent::new(
            Uuid::new_v4(),
            ScriptType::Shell,
            TaskEventKind::ExecutionFailed {
                exit_code: Some(2),
                error: "exited with code 2".to_string(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: TaskEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, event.task_id);
        assert_eq!(back.kind, event.kind);
    }
}
