//! Child flow invocation with token-based completion.
//!
//! A parent invokes a child flow as one durable step and waits for it:
//!
//! ```ignore
//! async fn run(self: Arc<Self>) -> Result<OrderOutcome, ExecutionError> {
//!     let confirmation = self
//!         .invoke(DeliverOrder::new(&self.order.id))
//!         .with_timeout(Duration::from_secs(300))
//!         .result()
//!         .await?;
//!     // ...
//! }
//! ```
//!
//! The child is its own instance, with its own history, keyed by its type
//! and business key. Its queue entry carries the parent's id, a token (the
//! child id, also the parent step's await key) and an optional deadline.
//! When the child finishes, fails or misses its deadline, the worker
//! completes the parent step waiting on that token with a
//! [`ChildCompletion`] and resumes the parent. The child knows nothing
//! about its parent.

use super::context::current_context;
use super::error::{ExecutionError, Result, SuspendReason};
use crate::core::{
    deserialize_value, flow_id_for, FlowType, Invocation, InvocationStatus,
    InvokableFlow, StepKind,
};
use crate::storage::{ScheduledFlow, StorageError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a child flow, delivered to the parent step that awaits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildCompletion {
    pub success: bool,
    /// Serialized child output when `success`.
    pub data: Vec<u8>,
    pub error: Option<String>,
}

impl ChildCompletion {
    pub fn succeeded(data: Vec<u8>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// A pending child flow invocation.
///
/// Pure data until [`result`](PendingChild::result) is awaited.
pub struct PendingChild<C> {
    child: C,
    timeout: Option<Duration>,
}

impl<C> PendingChild<C>
where
    C: InvokableFlow + Serialize + Send + Sync + 'static,
{
    /// Completion budget: the child fails if it has not finished within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Starts the child (first execution only) and waits for its output.
    ///
    /// # Errors
    /// - `ExecutionError::ChildFlow` if the child failed or ran out of budget
    /// - `ExecutionError::Suspended` while the child is still running
    pub async fn result(self) -> Result<C::Output> {
        let ctx = current_context()?;
        let child_type = C::type_id();
        let business_key = self.child.business_key();
        let child_id = flow_id_for(child_type, &business_key);
        let token = child_id.to_string();

        let claimed = ctx
            .claim_step(StepKind::ChildFlow, child_type, &self.child, None)
            .await?;
        let step = claimed.step;

        if let Some(inv) = claimed.existing.as_ref().filter(|inv| inv.is_complete()) {
            return decode::<C>(inv, &business_key);
        }

        // Wait on the token before the child exists, so a fast child always
        // finds the parent step to complete.
        let waiting = claimed
            .existing
            .as_ref()
            .is_some_and(|inv| inv.status() == InvocationStatus::WaitingForSignal);
        if !waiting {
            ctx.storage.log_signal(ctx.id, step, &token).await?;
        }

        if ctx.storage.get_flow(child_id).await?.is_none() {
            let mut scheduled = ScheduledFlow::new(
                child_id,
                child_type.to_string(),
                business_key.clone(),
                claimed.parameters,
            )
            .with_parent(ctx.id, token);

            if let Some(timeout) = self.timeout {
                let budget = chrono::Duration::from_std(timeout)
                    .map_err(|e| ExecutionError::Failed(format!("invalid child timeout: {}", e)))?;
                scheduled = scheduled.with_deadline(Utc::now() + budget);
            }

            match ctx.storage.enqueue_flow(scheduled).await {
                Ok(_) => info!(
                    "Flow {} started child {} '{}' ({})",
                    ctx.id, child_type, business_key, child_id
                ),
                Err(StorageError::DuplicateFlow(_)) => {
                    debug!("Child {} already enqueued", child_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // The child may have finished between the checks above
        if let Some(inv) = ctx
            .storage
            .get_invocation(ctx.id, step)
            .await?
            .filter(Invocation::is_complete)
        {
            return decode::<C>(&inv, &business_key);
        }

        Err(ctx.suspend(SuspendReason::Child {
            flow_id: ctx.id,
            step,
            child_id,
        }))
    }
}

fn decode<C: InvokableFlow>(inv: &Invocation, business_key: &str) -> Result<C::Output> {
    let completion: ChildCompletion = inv
        .deserialize_return_value()?
        .ok_or_else(|| {
            ExecutionError::Failed(format!("step {} has no child outcome", inv.step()))
        })?;

    if completion.success {
        return Ok(deserialize_value(&completion.data)?);
    }

    Err(ExecutionError::ChildFlow {
        flow_type: C::type_id().to_string(),
        business_key: business_key.to_string(),
        step: inv.step(),
        message: completion
            .error
            .unwrap_or_else(|| "child flow failed".to_string()),
    })
}

/// Extension trait for invoking child flows.
///
/// Implemented for every `Arc<T>` where `T: FlowType`, so a flow method
/// taking `self: Arc<Self>` can write `self.invoke(child)`.
pub trait InvokeChild {
    /// Invoke a child flow and get a handle to await its result.
    ///
    /// The result type is inferred from the child's `Output` type.
    fn invoke<C>(&self, child: C) -> PendingChild<C>
    where
        C: InvokableFlow + Serialize + Send + Sync + 'static;
}

impl<T> InvokeChild for Arc<T>
where
    T: FlowType,
{
    fn invoke<C>(&self, child: C) -> PendingChild<C>
    where
        C: InvokableFlow + Serialize + Send + Sync + 'static,
    {
        PendingChild {
            child,
            timeout: None,
        }
    }
}
