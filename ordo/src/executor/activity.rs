//! Activity execution.
//!
//! An activity is a unit of side-effecting work invoked by a flow. It runs
//! outside the replay boundary: the flow records only the activity's final
//! outcome, so on replay that outcome is returned without running the
//! activity again.
//!
//! Each attempt is bounded by three budgets, all from [`ActivityOptions`]:
//!
//! - **schedule-to-start**: how long the attempt may wait for a free slot
//!   in the [`ActivityExecutor`]
//! - **start-to-close**: how long one attempt may run
//! - **heartbeat**: the longest allowed gap between two
//!   [`ActivityContext::heartbeat`] calls (zero disables the check)
//!
//! Failed attempts are retried according to the options' [`RetryPolicy`]
//! when the failure is [`Retryable`].
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use ordo::executor::{Activity, ActivityContext, ActivityError};
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl Activity for Greet {
//!     const NAME: &'static str = "greet";
//!     type Input = String;
//!     type Output = String;
//!
//!     async fn execute(
//!         &self,
//!         ctx: &ActivityContext,
//!         name: String,
//!     ) -> Result<String, ActivityError> {
//!         ctx.heartbeat();
//!         Ok(format!("hello {}", name))
//!     }
//! }
//! ```

use super::context::current_context;
use super::error::{ExecutionError, RegistrationError, Result};
use crate::core::{
    deserialize_value, retry_with_policy, serialize_value, RetryPolicy, Retryable, StepKind,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-invocation timeouts and retry policy of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityOptions {
    /// Longest wait for an execution slot.
    pub schedule_to_start_timeout: Duration,
    /// Longest run of a single attempt.
    pub start_to_close_timeout: Duration,
    /// Longest gap between heartbeats. Zero disables the check.
    pub heartbeat_timeout: Duration,
    /// `None` means a single attempt.
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(20),
            retry_policy: None,
        }
    }
}

impl ActivityOptions {
    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = timeout;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Error returned by an activity implementation.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    pub retryable: bool,
}

impl ActivityError {
    /// A transient failure, worth another attempt.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure no retry will fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<String> for ActivityError {
    fn from(message: String) -> Self {
        Self::retryable(message)
    }
}

/// Final failure kind of an activity invocation, as recorded in history.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ActivityFailure {
    #[error("schedule-to-start timeout")]
    ScheduleToStartTimeout,

    #[error("start-to-close timeout")]
    StartToCloseTimeout,

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("{message}")]
    Failed { message: String, retryable: bool },

    #[error("activity panicked: {0}")]
    Panicked(String),

    #[error("activity not registered: {0}")]
    NotRegistered(String),
}

impl Retryable for ActivityFailure {
    fn is_retryable(&self) -> bool {
        match self {
            ActivityFailure::StartToCloseTimeout
            | ActivityFailure::HeartbeatTimeout
            | ActivityFailure::ScheduleToStartTimeout => true,
            ActivityFailure::Failed { retryable, .. } => *retryable,
            ActivityFailure::Panicked(_) | ActivityFailure::NotRegistered(_) => false,
        }
    }
}

impl From<ActivityError> for ActivityFailure {
    fn from(e: ActivityError) -> Self {
        ActivityFailure::Failed {
            message: e.message,
            retryable: e.retryable,
        }
    }
}

/// What an activity knows about the invocation it serves.
///
/// Activities never see the flow's state, only this context and their input.
pub struct ActivityContext {
    flow_id: Uuid,
    business_key: String,
    activity: String,
    attempt: u32,
    heartbeat: watch::Sender<u64>,
}

impl ActivityContext {
    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    pub fn business_key(&self) -> &str {
        &self.business_key
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reports liveness; resets the heartbeat budget.
    pub fn heartbeat(&self) {
        self.heartbeat.send_modify(|beats| *beats += 1);
    }
}

/// A typed activity.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Stable name recorded in history; must not change across deployments.
    const NAME: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> std::result::Result<Self::Output, ActivityError>;
}

type ActivityFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Vec<u8>, ActivityError>> + Send>>;

/// Type-erased activity: serialized input in, serialized output out.
type BoxedActivity = Arc<dyn Fn(ActivityContext, Vec<u8>) -> ActivityFuture + Send + Sync>;

/// Activities known to a worker, by name.
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<&'static str, BoxedActivity>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an activity under `A::NAME`.
    ///
    /// # Errors
    /// Returns `RegistrationError::DuplicateActivity` if the name is taken.
    pub fn register<A: Activity>(
        &mut self,
        activity: A,
    ) -> std::result::Result<(), RegistrationError> {
        if self.activities.contains_key(A::NAME) {
            return Err(RegistrationError::DuplicateActivity(A::NAME.to_string()));
        }

        let activity = Arc::new(activity);
        let boxed: BoxedActivity = Arc::new(move |ctx: ActivityContext, input: Vec<u8>| {
            let activity = Arc::clone(&activity);
            Box::pin(async move {
                let input: A::Input = deserialize_value(&input).map_err(|e| {
                    ActivityError::permanent(format!("invalid input for {}: {}", A::NAME, e))
                })?;
                let output = activity.execute(&ctx, input).await?;
                serialize_value(&output).map_err(|e| {
                    ActivityError::permanent(format!("invalid output of {}: {}", A::NAME, e))
                })
            })
        });

        debug!("Registered activity: {}", A::NAME);
        self.activities.insert(A::NAME, boxed);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    /// Names from `required` that are not registered.
    pub fn missing(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.contains(name))
            .map(|name| name.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    fn get(&self, name: &str) -> Option<BoxedActivity> {
        self.activities.get(name).cloned()
    }
}

/// Runs activities with bounded concurrency and per-attempt budgets.
pub struct ActivityExecutor {
    registry: RwLock<ActivityRegistry>,
    slots: Arc<Semaphore>,
}

impl ActivityExecutor {
    /// Creates an executor running at most `max_concurrent` attempts at a time.
    pub fn new(registry: ActivityRegistry, max_concurrent: usize) -> Self {
        Self {
            registry: RwLock::new(registry),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn register<A: Activity>(
        &self,
        activity: A,
    ) -> std::result::Result<(), RegistrationError> {
        self.registry.write().await.register(activity)
    }

    pub async fn missing(&self, required: &[&str]) -> Vec<String> {
        self.registry.read().await.missing(required)
    }

    /// Runs activity `name` until it succeeds or reaches its final failure.
    pub async fn execute(
        &self,
        name: &str,
        input: Vec<u8>,
        flow_id: Uuid,
        business_key: &str,
        options: &ActivityOptions,
    ) -> std::result::Result<Vec<u8>, ActivityFailure> {
        let Some(handler) = self.registry.read().await.get(name) else {
            return Err(ActivityFailure::NotRegistered(name.to_string()));
        };

        retry_with_policy(options.retry_policy, |attempt| {
            let (heartbeat, heartbeats) = watch::channel(0u64);
            let ctx = ActivityContext {
                flow_id,
                business_key: business_key.to_string(),
                activity: name.to_string(),
                attempt,
                heartbeat,
            };
            self.attempt(handler.clone(), ctx, heartbeats, input.clone(), options)
        })
        .await
    }

    async fn attempt(
        &self,
        handler: BoxedActivity,
        ctx: ActivityContext,
        mut heartbeats: watch::Receiver<u64>,
        input: Vec<u8>,
        options: &ActivityOptions,
    ) -> std::result::Result<Vec<u8>, ActivityFailure> {
        let name = ctx.activity.clone();
        let attempt = ctx.attempt;

        let permit = match tokio::time::timeout(
            options.schedule_to_start_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ActivityFailure::Failed {
                    message: "activity executor closed".to_string(),
                    retryable: false,
                })
            }
            Err(_) => {
                warn!(
                    "Activity {} not started within {:?}",
                    name, options.schedule_to_start_timeout
                );
                return Err(ActivityFailure::ScheduleToStartTimeout);
            }
        };

        debug!("Starting activity {} attempt {}", name, attempt);
        // Spawned so a panic in the activity is contained in its JoinHandle
        let mut task = tokio::spawn(async move {
            let _permit = permit;
            handler(ctx, input).await
        });

        let start_to_close = tokio::time::sleep(options.start_to_close_timeout);
        tokio::pin!(start_to_close);
        let mut heartbeat_open = true;

        loop {
            let heartbeat_timeout = options.heartbeat_timeout;
            let heartbeat_gap = async move {
                if heartbeat_timeout.is_zero() {
                    std::future::pending::<()>().await
                } else {
                    tokio::time::sleep(heartbeat_timeout).await
                }
            };

            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(bytes)) => Ok(bytes),
                        Ok(Err(e)) => {
                            debug!("Activity {} attempt {} failed: {}", name, attempt, e);
                            Err(e.into())
                        }
                        Err(e) if e.is_panic() => {
                            let message = panic_message(e.into_panic());
                            warn!("Activity {} panicked: {}", name, message);
                            Err(ActivityFailure::Panicked(message))
                        }
                        Err(e) => Err(ActivityFailure::Failed {
                            message: e.to_string(),
                            retryable: true,
                        }),
                    };
                }
                _ = &mut start_to_close => {
                    task.abort();
                    warn!(
                        "Activity {} attempt {} exceeded {:?}",
                        name, attempt, options.start_to_close_timeout
                    );
                    return Err(ActivityFailure::StartToCloseTimeout);
                }
                _ = heartbeat_gap => {
                    task.abort();
                    warn!("Activity {} attempt {} missed its heartbeat", name, attempt);
                    return Err(ActivityFailure::HeartbeatTimeout);
                }
                changed = heartbeats.changed(), if heartbeat_open => {
                    if changed.is_err() {
                        heartbeat_open = false;
                    }
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Invokes activity `A` as the next durable step of the running flow.
///
/// On first execution the activity runs through the worker's
/// [`ActivityExecutor`] and its final outcome, success or failure, is
/// recorded. On replay the recorded outcome is returned and the activity
/// does not run.
///
/// # Errors
/// - `ExecutionError::Activity` with the final [`ActivityFailure`]
/// - `ExecutionError::Incompatible` if history recorded a different step here
/// - `ExecutionError::NotInFlow` outside a flow
pub async fn execute_activity<A: Activity>(
    input: A::Input,
    options: &ActivityOptions,
) -> Result<A::Output> {
    let ctx = current_context()?;
    let claimed = ctx
        .claim_step(StepKind::Activity, A::NAME, &input, options.retry_policy)
        .await?;
    let step = claimed.step;

    let into_error = |failure: ActivityFailure| ExecutionError::Activity {
        name: A::NAME.to_string(),
        step,
        failure,
    };

    if let Some(inv) = claimed.existing.as_ref().filter(|inv| inv.is_complete()) {
        let recorded: Option<std::result::Result<A::Output, ActivityFailure>> =
            inv.deserialize_return_value()?;
        if let Some(recorded) = recorded {
            return recorded.map_err(into_error);
        }
    }

    let outcome = ctx
        .activities()
        .execute(
            A::NAME,
            claimed.parameters,
            ctx.id,
            ctx.business_key(),
            options,
        )
        .await;

    let outcome: std::result::Result<A::Output, ActivityFailure> = match outcome {
        Ok(bytes) => deserialize_value(&bytes).map_err(|e| ActivityFailure::Failed {
            message: format!("invalid output of {}: {}", A::NAME, e),
            retryable: false,
        }),
        Err(failure) => Err(failure),
    };

    ctx.complete_step(step, &outcome).await?;
    outcome.map_err(into_error)
}
