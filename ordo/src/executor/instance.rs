//! Flow instance execution.
//!
//! A [`FlowInstance`] pairs a flow object with its id and the services its
//! durable primitives need. [`FlowInstance::execute`] runs the flow method
//! once, from the top, inside a task-local [`ExecutionContext`]: recorded
//! steps replay from history, the first unrecorded step runs for real, and
//! the run ends when the flow returns or a primitive suspends it.
//!
//! Step 0 is the flow itself: its parameters are the serialized flow and,
//! once the flow returns `Ok`, its return value is the flow's output.

use super::activity::ActivityExecutor;
use super::context::{ExecutionContext, EXECUTION_CONTEXT};
use super::error::{ExecutionError, FlowOutcome, Result};
use crate::core::{serialize_value, FlowType, InvocationStatus, StepKind};
use crate::storage::{ExecutionLog, InvocationStartParams};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Flow instance holding the state of one flow execution.
pub struct FlowInstance<T> {
    /// The unique identifier for this flow execution.
    pub id: Uuid,
    /// The flow object containing the business logic.
    pub flow: Arc<T>,
    storage: Arc<dyn ExecutionLog>,
    activities: Arc<ActivityExecutor>,
}

impl<T> FlowInstance<T>
where
    T: FlowType + Serialize + Send + Sync + 'static,
{
    pub fn new(
        id: Uuid,
        flow: T,
        storage: Arc<dyn ExecutionLog>,
        activities: Arc<ActivityExecutor>,
    ) -> Self {
        Self {
            id,
            flow: Arc::new(flow),
            storage,
            activities,
        }
    }

    /// Runs `method` on the flow until it returns or suspends.
    ///
    /// # Example
    /// ```ignore
    /// let outcome = instance.execute(|flow| flow.run()).await;
    /// ```
    pub async fn execute<F, Fut, R, E>(&self, method: F) -> FlowOutcome<Result<R>>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        R: Serialize,
        E: Into<ExecutionError>,
    {
        match self.prepare().await {
            Ok(ctx) => {
                let ctx = Arc::new(ctx);
                let flow = Arc::clone(&self.flow);
                let result = EXECUTION_CONTEXT
                    .scope(Arc::clone(&ctx), async move { method(flow).await })
                    .await;

                // Authoritative even if the flow swallowed the Suspended error
                if let Some(reason) = ctx.take_suspend_reason() {
                    debug!("Flow {} suspended at step {}", self.id, reason.step());
                    return FlowOutcome::Suspended(reason);
                }

                let result = match result {
                    Ok(output) => ctx.complete_step(0, &output).await.map(|_| output),
                    Err(e) => Err(e.into()),
                };
                FlowOutcome::Completed(result)
            }
            Err(e) => FlowOutcome::Completed(Err(e)),
        }
    }

    /// Records step 0 on the first run and loads the replay watermark.
    async fn prepare(&self) -> Result<ExecutionContext> {
        let existing = self.storage.get_invocation(self.id, 0).await?;
        if existing.is_none() {
            let parameters = serialize_value(self.flow.as_ref())?;
            self.storage
                .log_invocation_start(InvocationStartParams {
                    id: self.id,
                    step: 0,
                    kind: StepKind::Flow,
                    name: T::type_id(),
                    status: InvocationStatus::Pending,
                    parameters: &parameters,
                    retry_policy: None,
                })
                .await?;
        }

        ExecutionContext::load(
            self.id,
            self.flow.business_key(),
            Arc::clone(&self.storage),
            Arc::clone(&self.activities),
        )
        .await
    }
}
