//! Execution context management module.
//!
//! This module provides execution state management for durable flows:
//! - ExecutionContext: flow id, storage, step counter and replay watermark
//! - EXECUTION_CONTEXT: task-local propagation of the context into the
//!   durable primitives ([`execute_activity`](super::execute_activity),
//!   [`sleep`](super::sleep), [`receive_signal`](super::receive_signal),
//!   child flow invocation)
//!
//! Every durable operation claims the next step number. On the first run the
//! step is logged; on replay the recorded step is validated against what the
//! code asks for and its recorded outcome is returned instead of running the
//! operation again.

use super::activity::ActivityExecutor;
use super::error::{ExecutionError, Result, SuspendReason};
use crate::core::{
    fingerprint, serialize_value, CoreError, Invocation, InvocationStatus, RetryPolicy, StepKind,
};
use crate::storage::{ExecutionLog, InvocationStartParams};
use serde::Serialize;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

tokio::task_local! {
    pub static EXECUTION_CONTEXT: Arc<ExecutionContext>;
}

/// Returns the context of the flow running on this task.
///
/// # Errors
/// Returns [`ExecutionError::NotInFlow`] when called outside a flow.
pub fn current_context() -> Result<Arc<ExecutionContext>> {
    EXECUTION_CONTEXT
        .try_with(|c| c.clone())
        .map_err(|_| ExecutionError::NotInFlow)
}

/// True while the running flow is re-executing already recorded history.
///
/// Flows use this to keep log lines from repeating on every resume. Outside
/// a flow it returns false.
pub fn is_replaying() -> bool {
    EXECUTION_CONTEXT
        .try_with(|c| c.is_replaying())
        .unwrap_or(false)
}

/// A step claimed by a durable operation.
pub(crate) struct ClaimedStep {
    pub step: i32,
    /// Serialized parameters of the operation.
    pub parameters: Vec<u8>,
    /// The recorded invocation, if this step already ran before.
    pub existing: Option<Invocation>,
}

/// Execution context for a single flow instance.
///
/// Uses `Arc<dyn ExecutionLog>` for storage so the context can live in a
/// task-local without carrying the backend type around.
pub struct ExecutionContext {
    /// The unique identifier for this flow execution.
    pub id: Uuid,
    /// The storage backend for persisting invocation logs.
    pub storage: Arc<dyn ExecutionLog>,
    business_key: String,
    /// Next step to hand out. Step 0 is the flow itself.
    step_counter: AtomicI32,
    /// Highest step recorded when this run started.
    replay_watermark: i32,
    /// Set by a primitive right before it returns `Suspended`; read by the
    /// instance runner regardless of what the flow did with the error.
    suspend_reason: Mutex<Option<SuspendReason>>,
    activities: Arc<ActivityExecutor>,
}

impl ExecutionContext {
    pub fn new(
        id: Uuid,
        business_key: impl Into<String>,
        storage: Arc<dyn ExecutionLog>,
        activities: Arc<ActivityExecutor>,
        replay_watermark: i32,
    ) -> Self {
        Self {
            id,
            storage,
            business_key: business_key.into(),
            step_counter: AtomicI32::new(1),
            replay_watermark,
            suspend_reason: Mutex::new(None),
            activities,
        }
    }

    /// Builds a context whose replay watermark comes from the stored history.
    pub async fn load(
        id: Uuid,
        business_key: impl Into<String>,
        storage: Arc<dyn ExecutionLog>,
        activities: Arc<ActivityExecutor>,
    ) -> Result<Self> {
        let history = storage.get_invocations_for_flow(id).await?;
        let watermark = history.iter().map(Invocation::step).max().unwrap_or(0);
        Ok(Self::new(id, business_key, storage, activities, watermark))
    }

    pub fn flow_id(&self) -> Uuid {
        self.id
    }

    pub fn business_key(&self) -> &str {
        &self.business_key
    }

    pub fn storage(&self) -> &Arc<dyn ExecutionLog> {
        &self.storage
    }

    pub(crate) fn activities(&self) -> &Arc<ActivityExecutor> {
        &self.activities
    }

    /// Returns the current step number and atomically increments the counter.
    pub fn next_step(&self) -> i32 {
        self.step_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// The most recently allocated step, 0 before the first durable operation.
    pub fn last_allocated_step(&self) -> i32 {
        self.step_counter.load(Ordering::SeqCst) - 1
    }

    /// True until the flow has passed the last step recorded before this run.
    pub fn is_replaying(&self) -> bool {
        self.last_allocated_step() < self.replay_watermark
    }

    /// Claims the next step for a durable operation of `kind` named `name`.
    ///
    /// If history already holds the step, it must be the same operation with
    /// the same parameters. A step that never got past PENDING (the process
    /// died while it ran) is logged again, which bumps its attempt counter.
    ///
    /// # Errors
    /// Returns `ExecutionError::Incompatible` when the recorded step differs.
    pub(crate) async fn claim_step<P: Serialize>(
        &self,
        kind: StepKind,
        name: &str,
        params: &P,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<ClaimedStep> {
        let step = self.next_step();
        let (parameters, params_hash) = fingerprint(params)?;

        let existing = self.storage.get_invocation(self.id, step).await?;
        if let Some(inv) = &existing {
            validate_invocation(inv, step, kind, name, params_hash)?;
        }

        let needs_log = existing
            .as_ref()
            .is_none_or(|inv| inv.status() == InvocationStatus::Pending);
        if needs_log {
            self.storage
                .log_invocation_start(InvocationStartParams {
                    id: self.id,
                    step,
                    kind,
                    name,
                    status: InvocationStatus::Pending,
                    parameters: &parameters,
                    retry_policy,
                })
                .await?;
        }

        Ok(ClaimedStep {
            step,
            parameters,
            existing,
        })
    }

    /// Records the outcome of a step.
    pub async fn complete_step<R: Serialize>(&self, step: i32, value: &R) -> Result<Invocation> {
        let bytes = serialize_value(value)?;
        let invocation = self
            .storage
            .log_invocation_completion(self.id, step, &bytes)
            .await?;
        Ok(invocation)
    }

    /// Parks the flow: records why and returns the error the primitive hands back.
    pub(crate) fn suspend(&self, reason: SuspendReason) -> ExecutionError {
        self.set_suspend_reason(reason);
        ExecutionError::Suspended
    }

    pub fn set_suspend_reason(&self, reason: SuspendReason) {
        match self.suspend_reason.lock() {
            Ok(mut guard) => *guard = Some(reason),
            Err(e) => {
                tracing::error!("Failed to set suspend reason: mutex poisoned - {:?}", e);
            }
        }
    }

    pub fn has_suspend_reason(&self) -> bool {
        self.suspend_reason
            .lock()
            .ok()
            .is_some_and(|guard| guard.is_some())
    }

    /// Takes and clears the suspension reason.
    pub fn take_suspend_reason(&self) -> Option<SuspendReason> {
        self.suspend_reason
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }
}

/// Checks that a recorded step is the operation the code is asking for now.
fn validate_invocation(
    inv: &Invocation,
    step: i32,
    kind: StepKind,
    name: &str,
    params_hash: u64,
) -> Result<()> {
    if inv.kind() != kind || inv.name() != name {
        return Err(CoreError::IncompatibleFlowStructure {
            step,
            expected: format!("{} {}", inv.kind(), inv.name()),
            actual: format!("{} {}", kind, name),
        }
        .into());
    }

    if inv.params_hash() != params_hash {
        return Err(CoreError::IncompatibleFlowStructure {
            step,
            expected: format!("{} {} (params 0x{:016x})", kind, name, inv.params_hash()),
            actual: format!("{} {} (params 0x{:016x})", kind, name, params_hash),
        }
        .into());
    }

    Ok(())
}
