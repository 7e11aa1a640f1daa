use crate::core::{CoreError, Retryable};
use crate::executor::activity::ActivityFailure;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Execution layer error type for the ordo orchestration engine.
///
/// This error type wraps storage and core errors while also providing
/// execution-specific variants for activities, child flows and replay.
/// It is `Clone + Serialize` so a failed flow's error can be recorded.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ExecutionError {
    /// A storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(String),

    /// Flow execution failed with the given reason.
    #[error("execution failed: {0}")]
    Failed(String),

    /// Flow execution failed and must not be retried.
    #[error("execution failed permanently: {0}")]
    NonRetryable(String),

    /// The flow took a different path than its recorded history.
    #[error("flow incompatible: {0}")]
    Incompatible(String),

    /// A background task panicked during execution.
    #[error("task panicked: {0}")]
    TaskPanic(String),

    /// The flow is parked on a timer, signal or child flow.
    ///
    /// Never surfaces to callers of the worker: it is turned into
    /// a suspension by the instance runner.
    #[error("flow suspended")]
    Suspended,

    /// An activity reached its final failure.
    #[error("activity '{name}' failed at step {step}: {failure}")]
    Activity {
        name: String,
        step: i32,
        failure: ActivityFailure,
    },

    /// A child flow failed or exceeded its completion budget.
    #[error("child flow {flow_type} '{business_key}' failed at step {step}: {message}")]
    ChildFlow {
        flow_type: String,
        business_key: String,
        step: i32,
        message: String,
    },

    /// A durable primitive was called outside a running flow.
    #[error("called outside a flow execution")]
    NotInFlow,
}

impl ExecutionError {
    /// Step at which the flow failed, when the error carries one.
    pub fn step(&self) -> Option<i32> {
        match self {
            ExecutionError::Activity { step, .. } | ExecutionError::ChildFlow { step, .. } => {
                Some(*step)
            }
            _ => None,
        }
    }
}

// Manual From implementations to convert nested errors to strings
impl From<StorageError> for ExecutionError {
    fn from(e: StorageError) -> Self {
        ExecutionError::Storage(e.to_string())
    }
}

impl From<CoreError> for ExecutionError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::IncompatibleFlowStructure { .. } => {
                ExecutionError::Incompatible(e.to_string())
            }
            other => ExecutionError::Core(other.to_string()),
        }
    }
}

impl From<String> for ExecutionError {
    fn from(s: String) -> Self {
        ExecutionError::Failed(s)
    }
}

/// Only infrastructure trouble is worth running the flow again; everything
/// else has already been retried at the activity level or is deterministic.
impl Retryable for ExecutionError {
    fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Storage(_) | ExecutionError::Core(_))
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors returned to external actors by [`Client`](crate::executor::Client).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// The instance already reached a terminal status.
    #[error("flow already finished: {0}")]
    FlowFinished(String),

    #[error("flow already started: {0}")]
    AlreadyStarted(String),

    #[error("timed out waiting for flow {0}")]
    Timeout(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Errors raised while wiring activities and flows into a worker.
///
/// These surface at startup, before any instance runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistrationError {
    #[error("activity '{0}' is already registered")]
    DuplicateActivity(String),

    #[error("flow type '{0}' is already registered")]
    DuplicateFlow(String),

    /// A flow depends on activities nobody registered.
    #[error("flow type '{flow_type}' requires unregistered activities: {}", missing.join(", "))]
    MissingActivities {
        flow_type: String,
        missing: Vec<String>,
    },
}

/// Reason why a flow suspended execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SuspendReason {
    /// Waiting for a timer to fire.
    Timer { flow_id: Uuid, step: i32 },
    /// Waiting for an external signal.
    Signal {
        flow_id: Uuid,
        step: i32,
        signal_name: String,
    },
    /// Waiting for a child flow to finish.
    Child {
        flow_id: Uuid,
        step: i32,
        child_id: Uuid,
    },
}

impl SuspendReason {
    pub fn step(&self) -> i32 {
        match self {
            SuspendReason::Timer { step, .. }
            | SuspendReason::Signal { step, .. }
            | SuspendReason::Child { step, .. } => *step,
        }
    }
}

/// A flow can complete or suspend. Be honest about it.
#[derive(Debug, Clone)]
pub enum FlowOutcome<R> {
    /// Flow ran to completion (success or failure in R).
    Completed(R),
    /// Flow suspended, waiting for a timer, signal or child flow.
    Suspended(SuspendReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_infrastructure_errors_are_retryable() {
        assert!(ExecutionError::Storage("locked".into()).is_retryable());
        assert!(ExecutionError::Core("bad json".into()).is_retryable());
        assert!(!ExecutionError::Incompatible("step 2".into()).is_retryable());
        assert!(!ExecutionError::TaskPanic("boom".into()).is_retryable());
        assert!(!ExecutionError::Activity {
            name: "deliver".into(),
            step: 2,
            failure: ActivityFailure::StartToCloseTimeout,
        }
        .is_retryable());
    }

    #[test]
    fn test_incompatible_structure_maps_to_incompatible() {
        let err: ExecutionError = CoreError::IncompatibleFlowStructure {
            step: 3,
            expected: "TIMER".into(),
            actual: "ACTIVITY deliver".into(),
        }
        .into();
        assert!(matches!(err, ExecutionError::Incompatible(_)));
    }

    #[test]
    fn test_error_survives_serialization() {
        let err = ExecutionError::ChildFlow {
            flow_type: "DeliverOrder".into(),
            business_key: "42".into(),
            step: 3,
            message: "deadline exceeded".into(),
        };
        let bytes = serde_json::to_vec(&err).unwrap();
        let back: ExecutionError = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.step(), Some(3));
        assert_eq!(back.to_string(), err.to_string());
    }
}
