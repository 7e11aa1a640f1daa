//! Client API for external actors.
//!
//! The [`Client`] is how the outside world talks to flows: it starts
//! instances, delivers signals and reads back status and results. It only
//! touches storage; workers pick the work up from there.

use super::error::ClientError;
use super::signal::SignalType;
use crate::core::{
    deserialize_value, flow_id_for, flow_id_of, serialize_value, FlowType, Invocation,
};
use crate::storage::{ExecutionLog, ScheduledFlow, StorageError, TaskStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Externally visible status of a flow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Pending,
    Running,
    /// Parked on a timer, signal or child flow.
    Suspended,
    Completed,
    Failed { error: String },
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed { .. })
    }

    fn of(flow: &ScheduledFlow) -> Self {
        match flow.status {
            TaskStatus::Pending => FlowStatus::Pending,
            TaskStatus::Running => FlowStatus::Running,
            TaskStatus::Suspended => FlowStatus::Suspended,
            TaskStatus::Complete => FlowStatus::Completed,
            TaskStatus::Failed => FlowStatus::Failed {
                error: flow
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
        }
    }
}

/// Starts flows, sends them signals and queries their state.
///
/// # Example
///
/// ```no_run
/// use ordo::executor::Client;
/// use ordo::flows::{HandleEatsOrder, Order, OrderDecision};
/// use ordo::storage::InMemoryExecutionLog;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new(Arc::new(InMemoryExecutionLog::new()));
///
/// let order = Order::new("o-1", ["pizza"]);
/// let flow_id = client.start(&HandleEatsOrder::new("u-1", order, "r-1")).await?;
///
/// client
///     .signal::<HandleEatsOrder, _>("o-1", &OrderDecision::accept())
///     .await?;
/// println!("{:?}", client.status(flow_id).await?);
/// # Ok(())
/// # }
/// ```
pub struct Client<S: ExecutionLog> {
    storage: Arc<S>,
}

impl<S: ExecutionLog> Client<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Enqueues a new instance of `flow` and returns its flow id.
    ///
    /// # Errors
    /// `ClientError::AlreadyStarted` if an instance with the same type and
    /// business key exists, running or finished.
    pub async fn start<F>(&self, flow: &F) -> Result<Uuid, ClientError>
    where
        F: FlowType + Serialize,
    {
        let flow_id = flow_id_of(flow);
        let business_key = flow.business_key();
        let flow_data = serialize_value(flow)?;

        let scheduled = ScheduledFlow::new(
            flow_id,
            F::type_id().to_string(),
            business_key.clone(),
            flow_data,
        );

        match self.storage.enqueue_flow(scheduled).await {
            Ok(_) => {
                info!("Started flow {} '{}' ({})", F::type_id(), business_key, flow_id);
                Ok(flow_id)
            }
            Err(StorageError::DuplicateFlow(_)) => Err(ClientError::AlreadyStarted(format!(
                "{} '{}'",
                F::type_id(),
                business_key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Delivers a signal to the `F` instance keyed by `business_key`.
    ///
    /// The message is queued durably and consumed by the instance's next
    /// matching receive, even if the instance has not reached it yet.
    ///
    /// # Errors
    /// `FlowNotFound` for an unknown instance, `FlowFinished` for one that
    /// already completed or failed.
    pub async fn signal<F, Sig>(&self, business_key: &str, payload: &Sig) -> Result<(), ClientError>
    where
        F: FlowType,
        Sig: SignalType,
    {
        let flow_id = flow_id_for(F::type_id(), business_key);
        let describe = || format!("{} '{}'", F::type_id(), business_key);

        let flow = self
            .storage
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| ClientError::FlowNotFound(describe()))?;
        if flow.is_finished() {
            return Err(ClientError::FlowFinished(describe()));
        }

        let bytes = serialize_value(payload)?;
        self.storage.push_signal(flow_id, Sig::NAME, &bytes).await?;
        debug!("Queued signal '{}' for {}", Sig::NAME, describe());

        // Wake it if it is parked; a running instance re-checks on suspend
        self.storage.resume_flow(flow_id).await?;
        Ok(())
    }

    pub async fn status(&self, flow_id: Uuid) -> Result<FlowStatus, ClientError> {
        let flow = self
            .storage
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| ClientError::FlowNotFound(flow_id.to_string()))?;
        Ok(FlowStatus::of(&flow))
    }

    pub async fn status_by_key<F: FlowType>(
        &self,
        business_key: &str,
    ) -> Result<FlowStatus, ClientError> {
        self.status(flow_id_for(F::type_id(), business_key)).await
    }

    /// Output of a completed instance, `None` while it has not completed.
    pub async fn result<R: DeserializeOwned>(
        &self,
        flow_id: Uuid,
    ) -> Result<Option<R>, ClientError> {
        let Some(flow_step) = self.storage.get_invocation(flow_id, 0).await? else {
            return Ok(None);
        };
        match flow_step.return_value() {
            Some(bytes) if flow_step.is_complete() => Ok(Some(deserialize_value(bytes)?)),
            _ => Ok(None),
        }
    }

    /// Recorded steps of an instance, ordered by step number.
    pub async fn history(&self, flow_id: Uuid) -> Result<Vec<Invocation>, ClientError> {
        Ok(self.storage.get_invocations_for_flow(flow_id).await?)
    }

    /// Waits until the instance reaches a terminal status.
    ///
    /// # Errors
    /// `ClientError::Timeout` if it is still unfinished after `timeout`.
    pub async fn wait_for_completion(
        &self,
        flow_id: Uuid,
        timeout: Duration,
    ) -> Result<FlowStatus, ClientError> {
        let notify = self.storage.status_notify();
        let wait = async {
            loop {
                // Register before checking so a change in between is not lost
                let notified = notify.as_ref().map(|n| n.notified());
                let status = self.status(flow_id).await?;
                if status.is_terminal() {
                    return Ok::<_, ClientError>(status);
                }
                match notified {
                    Some(notified) => {
                        tokio::time::timeout(Duration::from_millis(250), notified)
                            .await
                            .ok();
                    }
                    None => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout(flow_id))?
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}

impl<S: ExecutionLog> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}
