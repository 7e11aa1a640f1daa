//! Queue types for flow execution.
//!
//! A flow instance is started by enqueueing a [`ScheduledFlow`]; workers
//! dequeue it, run it until it completes or suspends, and write the outcome
//! back. The same entry carries the instance's whole lifecycle, so its
//! status doubles as the externally visible instance status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a scheduled flow in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Flow is waiting to be picked up by a worker.
    Pending,
    /// Flow is currently being executed by a worker.
    Running,
    /// Flow is parked until a timer, signal or child flow wakes it.
    Suspended,
    /// Flow has completed successfully.
    Complete,
    /// Flow execution failed.
    Failed,
}

impl TaskStatus {
    /// Returns the string representation of the task status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Suspended => "SUSPENDED",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUSPENDED" => Ok(TaskStatus::Suspended),
            "COMPLETE" => Ok(TaskStatus::Complete),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(format!("unknown task status: {}", s)),
        }
    }
}

/// A flow instance scheduled for execution.
///
/// The flow data is stored as serialized bytes and deserialized by the
/// worker that picks it up.
#[derive(Debug, Clone)]
pub struct ScheduledFlow {
    /// Unique identifier for this scheduled task.
    pub task_id: Uuid,
    /// The flow's instance ID (deterministic from type and business key).
    pub flow_id: Uuid,
    /// Stable flow type name (see `FlowType::type_id`).
    pub flow_type: String,
    /// Domain identifier of the instance, e.g. the order id.
    pub business_key: String,
    /// Serialized flow instance data.
    pub flow_data: Vec<u8>,
    /// Current status of this task.
    pub status: TaskStatus,
    /// Worker ID that locked this task (if running).
    pub locked_by: Option<String>,
    /// When this task was created.
    pub created_at: DateTime<Utc>,
    /// When this task was last updated.
    pub updated_at: DateTime<Utc>,
    /// Number of times this task has been retried after an infrastructure failure.
    pub retry_count: u32,
    /// Last error message (failure reason, or the error that caused a retry).
    pub error_message: Option<String>,
    /// Earliest time a worker may pick the task up (delayed retry).
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Completion budget: the instance fails if it has not finished by then.
    pub deadline: Option<DateTime<Utc>>,
    /// Parent instance waiting on this one, for child flows.
    pub parent_flow_id: Option<Uuid>,
    /// Await key of the parent step that receives this child's outcome.
    pub signal_token: Option<String>,
}

impl ScheduledFlow {
    /// Creates a new scheduled flow in pending status.
    pub fn new(flow_id: Uuid, flow_type: String, business_key: String, flow_data: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            flow_id,
            flow_type,
            business_key,
            flow_data,
            status: TaskStatus::Pending,
            locked_by: None,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            error_message: None,
            scheduled_for: None,
            deadline: None,
            parent_flow_id: None,
            signal_token: None,
        }
    }

    /// Marks this flow as the child of `parent_flow_id`, reporting back to
    /// the parent step waiting on `signal_token`.
    pub fn with_parent(mut self, parent_flow_id: Uuid, signal_token: String) -> Self {
        self.parent_flow_id = Some(parent_flow_id);
        self.signal_token = Some(signal_token);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns true if this task is currently locked by a worker.
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Returns true if this task has completed (successfully or with failure).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the deadline has passed and the task is not finished.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished() && self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// An expired timer found by the timer pass.
#[derive(Debug, Clone)]
pub struct TimerInfo {
    pub flow_id: Uuid,
    pub step: i32,
    pub fire_at: DateTime<Utc>,
    pub timer_name: Option<String>,
}
