//! Worker for flow execution.
//!
//! We use `Worker` and `Registry` instead of `FlowWorker` and `FlowRegistry`
//! since the `ordo::executor` path already says what they are about.
//!
//! A worker pulls flow instances from the storage queue and runs each until
//! it completes or suspends. Between runs it keeps the durable machinery
//! moving: it fires expired timers, fails children that ran out of budget,
//! and reports finished children to their parents.

use super::activity::{Activity, ActivityExecutor, ActivityRegistry};
use super::child_flow::ChildCompletion;
use super::config::{ConfigError, WorkerConfig};
use super::error::{ExecutionError, FlowOutcome, RegistrationError, SuspendReason};
use super::instance::FlowInstance;
use crate::core::{deserialize_value, serialize_value, FlowType, RetryPolicy, Retryable};
use crate::storage::{ExecutionLog, ScheduledFlow, TaskStatus};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

// ============================================================================
// Tracing Typestates
// ============================================================================

/// Typestate: Worker without structured tracing (uses basic log-style tracing only).
///
/// This is the default state. Basic `info!`, `debug!`, `warn!`, and `error!`
/// calls are still used, but no spans are created.
#[derive(Clone, Copy)]
pub struct WithoutStructuredTracing;

/// Typestate: Worker with structured tracing enabled.
///
/// Wraps the worker loop, every flow run and every timer pass in a span
/// carrying the relevant identifiers.
#[derive(Clone, Copy)]
pub struct WithStructuredTracing;

/// Tracing behavior selected by the worker's typestate.
pub trait TracingBehavior: Send + Sync {
    fn worker_loop_span(&self, worker_id: &str) -> Option<tracing::Span>;

    fn flow_execution_span(&self, worker_id: &str, flow: &ScheduledFlow)
        -> Option<tracing::Span>;

    fn timer_processing_span(&self, worker_id: &str) -> Option<tracing::Span>;
}

impl TracingBehavior for WithoutStructuredTracing {
    fn worker_loop_span(&self, _worker_id: &str) -> Option<tracing::Span> {
        None
    }

    fn flow_execution_span(
        &self,
        _worker_id: &str,
        _flow: &ScheduledFlow,
    ) -> Option<tracing::Span> {
        None
    }

    fn timer_processing_span(&self, _worker_id: &str) -> Option<tracing::Span> {
        None
    }
}

impl TracingBehavior for WithStructuredTracing {
    fn worker_loop_span(&self, worker_id: &str) -> Option<tracing::Span> {
        Some(tracing::info_span!("worker_loop", worker.id = worker_id))
    }

    fn flow_execution_span(&self, worker_id: &str, flow: &ScheduledFlow) -> Option<tracing::Span> {
        Some(tracing::info_span!(
            "flow_execution",
            worker.id = worker_id,
            flow.id = %flow.flow_id,
            flow.type = %flow.flow_type,
            flow.key = %flow.business_key,
            task.id = %flow.task_id,
        ))
    }

    fn timer_processing_span(&self, worker_id: &str) -> Option<tracing::Span> {
        Some(tracing::debug_span!(
            "timer_processing",
            worker.id = worker_id,
            timers.found = tracing::field::Empty,
        ))
    }
}

/// Type-erased flow executor: flow bytes and id in, outcome out.
///
/// Wrapped in Arc so it can be cloned out of the registry and run without
/// holding the registry lock.
type BoxedExecutor<S> = Arc<
    dyn Fn(
            Vec<u8>,
            Uuid,
            Arc<S>,
            Arc<ActivityExecutor>,
        ) -> Pin<Box<dyn Future<Output = FlowOutcome<Result<(), ExecutionError>>> + Send>>
        + Send
        + Sync,
>;

/// Registry that maps flow type names to their executors.
pub struct Registry<S: ExecutionLog> {
    executors: HashMap<String, BoxedExecutor<S>>,
}

impl<S: ExecutionLog + 'static> Registry<S> {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registers a flow type with its executor function.
    ///
    /// The executor function receives an `Arc<T>` of the deserialized flow
    /// and returns the future that runs it.
    ///
    /// # Errors
    /// Returns `RegistrationError::DuplicateFlow` if the type is already known.
    pub fn register<T, F, Fut, R, E>(&mut self, executor: F) -> Result<(), RegistrationError>
    where
        T: DeserializeOwned + Serialize + FlowType + Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + Sync + 'static,
        E: Into<ExecutionError> + Send + 'static,
    {
        let type_name = T::type_id().to_string();
        if self.executors.contains_key(&type_name) {
            return Err(RegistrationError::DuplicateFlow(type_name));
        }

        let boxed: BoxedExecutor<S> = Arc::new(
            move |data: Vec<u8>,
                  flow_id: Uuid,
                  storage: Arc<S>,
                  activities: Arc<ActivityExecutor>| {
                let executor = executor.clone();

                Box::pin(async move {
                    let flow: T = match deserialize_value(&data) {
                        Ok(f) => f,
                        Err(e) => {
                            return FlowOutcome::Completed(Err(ExecutionError::Failed(format!(
                                "failed to deserialize flow: {}",
                                e
                            ))))
                        }
                    };

                    let instance = FlowInstance::new(flow_id, flow, storage, activities);
                    match instance.execute(executor).await {
                        FlowOutcome::Suspended(reason) => FlowOutcome::Suspended(reason),
                        FlowOutcome::Completed(result) => {
                            FlowOutcome::Completed(result.map(|_| ()))
                        }
                    }
                })
            },
        );

        debug!("Registered flow type: {}", type_name);
        self.executors.insert(type_name, boxed);
        Ok(())
    }

    fn get_executor(&self, flow_type: &str) -> Option<BoxedExecutor<S>> {
        self.executors.get(flow_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl<S: ExecutionLog + 'static> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker that executes flows from the storage queue.
///
/// # Example
///
/// ```no_run
/// use ordo::executor::Worker;
/// use ordo::flows::{DeliverOrder, HandleEatsOrder};
/// use ordo::storage::InMemoryExecutionLog;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = Arc::new(InMemoryExecutionLog::new());
/// let worker = Worker::new(storage, "eats-worker-1").with_structured_tracing();
///
/// ordo::flows::register_activities(&worker).await?;
/// worker.register(|flow: Arc<HandleEatsOrder>| flow.run()).await?;
/// worker.register(|flow: Arc<DeliverOrder>| flow.run()).await?;
///
/// let handle = worker.start().await?;
/// // ...
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Worker<S: ExecutionLog + 'static, Tr = WithoutStructuredTracing> {
    storage: Arc<S>,
    worker_id: String,
    config: WorkerConfig,
    registry: Arc<RwLock<Registry<S>>>,
    activities: Arc<ActivityExecutor>,
    tracing_state: Tr,
    work_notify: Arc<Notify>,
}

impl<S: ExecutionLog + 'static> Worker<S, WithoutStructuredTracing> {
    /// Creates a worker with the default [`WorkerConfig`].
    pub fn new(storage: Arc<S>, worker_id: impl Into<String>) -> Self {
        Self::with_config(storage, worker_id, WorkerConfig::default())
    }

    pub fn with_config(
        storage: Arc<S>,
        worker_id: impl Into<String>,
        config: WorkerConfig,
    ) -> Self {
        // Fall back to a private notify when the backend cannot signal new work
        let work_notify = storage
            .work_notify()
            .unwrap_or_else(|| Arc::new(Notify::new()));
        let activities = Arc::new(ActivityExecutor::new(
            ActivityRegistry::new(),
            config.max_concurrent_activities,
        ));

        Self {
            storage,
            worker_id: worker_id.into(),
            config,
            registry: Arc::new(RwLock::new(Registry::new())),
            activities,
            tracing_state: WithoutStructuredTracing,
            work_notify,
        }
    }

    /// Enables structured tracing spans for this worker.
    pub fn with_structured_tracing(self) -> Worker<S, WithStructuredTracing> {
        Worker {
            storage: self.storage,
            worker_id: self.worker_id,
            config: self.config,
            registry: self.registry,
            activities: self.activities,
            tracing_state: WithStructuredTracing,
            work_notify: self.work_notify,
        }
    }
}

impl<S, Tr> Worker<S, Tr>
where
    S: ExecutionLog + 'static,
    Tr: TracingBehavior + Clone + 'static,
{
    /// Fallback wait between dequeue attempts. Default is 1 second.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// How often expired timers and overdue children are checked.
    pub fn with_timer_interval(mut self, interval: Duration) -> Self {
        self.config.timer_interval = interval;
        self
    }

    /// Limits how many flows run at once.
    pub fn with_max_concurrent_flows(mut self, max: usize) -> Self {
        self.config.max_concurrent_flows = Some(max);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Registers an activity flows on this worker may invoke.
    pub async fn register_activity<A: Activity>(
        &self,
        activity: A,
    ) -> Result<(), RegistrationError> {
        self.activities.register(activity).await
    }

    /// Registers a flow type with its executor function.
    ///
    /// Every activity named by `Flow::required_activities()` must already
    /// be registered.
    ///
    /// # Errors
    /// `MissingActivities` or `DuplicateFlow`.
    pub async fn register<Flow, F, Fut, R, E>(&self, executor: F) -> Result<(), RegistrationError>
    where
        Flow: DeserializeOwned + Serialize + FlowType + Send + Sync + 'static,
        F: Fn(Arc<Flow>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + Sync + 'static,
        E: Into<ExecutionError> + Send + 'static,
    {
        let missing = self.activities.missing(Flow::required_activities()).await;
        if !missing.is_empty() {
            return Err(RegistrationError::MissingActivities {
                flow_type: Flow::type_id().to_string(),
                missing,
            });
        }

        let mut registry = self.registry.write().await;
        registry.register(executor)
    }

    // ========================================================================
    // Maintenance passes
    // ========================================================================

    /// Completes expired timers and resumes their flows.
    async fn process_timers(storage: &Arc<S>) {
        let timers = match storage.get_expired_timers(Utc::now()).await {
            Ok(timers) => timers,
            Err(e) => {
                warn!("Failed to fetch expired timers: {}", e);
                return;
            }
        };

        if !timers.is_empty() {
            tracing::Span::current().record("timers.found", timers.len());
            debug!("Processing {} expired timers", timers.len());
        }

        for timer in timers {
            // Optimistic concurrency: exactly one claimant wins
            match storage.claim_timer(timer.flow_id, timer.step).await {
                Ok(true) => {
                    info!(
                        "Timer fired: flow={} step={} name={:?}",
                        timer.flow_id, timer.step, timer.timer_name
                    );
                    match storage.resume_flow(timer.flow_id).await {
                        Ok(true) => debug!("Resumed flow after timer: {}", timer.flow_id),
                        Ok(false) => debug!(
                            "Flow {} not suspended yet, resumes when it suspends",
                            timer.flow_id
                        ),
                        Err(e) => warn!(
                            "Failed to resume flow after timer: flow={} step={} error={}",
                            timer.flow_id, timer.step, e
                        ),
                    }
                }
                Ok(false) => debug!(
                    "Timer already fired: flow={} step={}",
                    timer.flow_id, timer.step
                ),
                Err(e) => warn!(
                    "Failed to claim timer (will retry): flow={} step={} error={}",
                    timer.flow_id, timer.step, e
                ),
            }
        }
    }

    /// Fails instances whose completion budget ran out.
    async fn process_overdue(storage: &Arc<S>) {
        let overdue = match storage.get_overdue_flows(Utc::now()).await {
            Ok(flows) => flows,
            Err(e) => {
                warn!("Failed to fetch overdue flows: {}", e);
                return;
            }
        };

        for flow in overdue {
            let message = "deadline exceeded".to_string();
            match storage
                .complete_flow(flow.task_id, TaskStatus::Failed, Some(message.clone()))
                .await
            {
                Ok(true) => {
                    warn!(
                        "Flow {} '{}' ({}) exceeded its completion budget",
                        flow.flow_type, flow.business_key, flow.flow_id
                    );
                    Self::notify_parent(storage, &flow, ChildCompletion::failed(message)).await;
                }
                Ok(false) => debug!("Overdue flow {} finished in the meantime", flow.flow_id),
                Err(e) => warn!("Failed to fail overdue flow {}: {}", flow.flow_id, e),
            }
        }
    }

    // ========================================================================
    // Outcome handling
    // ========================================================================

    /// Completes the parent step waiting on a finished child and resumes the parent.
    async fn notify_parent(storage: &Arc<S>, flow: &ScheduledFlow, completion: ChildCompletion) {
        let (Some(parent_id), Some(token)) = (flow.parent_flow_id, flow.signal_token.as_deref())
        else {
            return;
        };

        let payload = match serialize_value(&completion) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize child outcome for parent {}: {}", parent_id, e);
                return;
            }
        };

        match storage.complete_waiting_step(parent_id, token, &payload).await {
            Ok(true) => debug!(
                "Delivered outcome of child {} to parent {}",
                flow.flow_id, parent_id
            ),
            Ok(false) => {
                debug!(
                    "No step of parent {} waiting on child {}",
                    parent_id, flow.flow_id
                );
                return;
            }
            Err(e) => {
                error!(
                    "Failed to deliver outcome of child {} to parent {}: {}",
                    flow.flow_id, parent_id, e
                );
                return;
            }
        }

        match storage.resume_flow(parent_id).await {
            Ok(true) => debug!("Resumed parent flow {}", parent_id),
            Ok(false) => debug!(
                "Parent flow {} not in SUSPENDED state (will resume when it suspends)",
                parent_id
            ),
            Err(e) => warn!("Failed to resume parent flow {}: {}", parent_id, e),
        }
    }

    /// Marks a flow suspended, then resumes it at once if what it waits for
    /// arrived while it was still running.
    async fn handle_suspended_flow(
        storage: &Arc<S>,
        worker_id: &str,
        flow: &ScheduledFlow,
        reason: SuspendReason,
    ) {
        info!(
            "Worker {} flow suspended: flow={} key={} reason={:?}",
            worker_id, flow.flow_id, flow.business_key, reason
        );

        match storage.suspend_flow(flow.task_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Failed by its deadline while it ran
                debug!("Flow {} was no longer running", flow.flow_id);
                return;
            }
            Err(e) => {
                error!("Worker {} failed to mark flow suspended: {}", worker_id, e);
                return;
            }
        }

        let ready = match &reason {
            SuspendReason::Signal { signal_name, .. } => storage
                .has_pending_signal(flow.flow_id, signal_name)
                .await
                .unwrap_or(false),
            SuspendReason::Timer { step, .. } | SuspendReason::Child { step, .. } => {
                match storage.get_invocation(flow.flow_id, *step).await {
                    Ok(Some(inv)) => inv.is_complete() || inv.is_timer_expired(Utc::now()),
                    _ => false,
                }
            }
        };

        if ready {
            match storage.resume_flow(flow.flow_id).await {
                Ok(true) => debug!("Resumed flow {} right after suspending", flow.flow_id),
                Ok(false) => debug!("Flow {} already resumed", flow.flow_id),
                Err(e) => warn!("Failed to resume flow {}: {}", flow.flow_id, e),
            }
        }
    }

    /// Handles a successfully completed flow.
    async fn handle_flow_completion(storage: &Arc<S>, worker_id: &str, flow: &ScheduledFlow) {
        match storage
            .complete_flow(flow.task_id, TaskStatus::Complete, None)
            .await
        {
            Ok(true) => info!(
                "Worker {} completed flow {} '{}'",
                worker_id, flow.flow_type, flow.business_key
            ),
            Ok(false) => {
                // Budget expired first; the parent has already been told
                warn!(
                    "Flow {} '{}' finished after it had been failed",
                    flow.flow_type, flow.business_key
                );
                return;
            }
            Err(e) => {
                error!("Worker {} failed to mark flow complete: {}", worker_id, e);
                return;
            }
        }

        if flow.parent_flow_id.is_none() {
            return;
        }

        let output = storage
            .get_invocation(flow.flow_id, 0)
            .await
            .ok()
            .flatten()
            .and_then(|inv| inv.return_value().map(|v| v.to_vec()));
        let completion = match output {
            Some(bytes) => ChildCompletion::succeeded(bytes),
            None => ChildCompletion::failed("child output missing"),
        };
        Self::notify_parent(storage, flow, completion).await;
    }

    /// Handles a failed flow: infrastructure errors are run again with
    /// backoff, everything else fails the instance and its waiting parent.
    async fn handle_flow_error(
        storage: &Arc<S>,
        worker_id: &str,
        flow: &ScheduledFlow,
        error: ExecutionError,
        retry_policy: RetryPolicy,
    ) {
        let error_msg = error.to_string();

        if error.is_retryable() {
            if let Some(delay) = retry_policy.delay_for_attempt(flow.retry_count + 1) {
                warn!(
                    "Worker {} retrying flow {} '{}' (attempt {}) after {:?}: {}",
                    worker_id,
                    flow.flow_type,
                    flow.business_key,
                    flow.retry_count + 2,
                    delay,
                    error_msg
                );
                if let Err(e) = storage.retry_flow(flow.task_id, error_msg, delay).await {
                    error!("Worker {} failed to schedule retry: {}", worker_id, e);
                }
                return;
            }
        }

        error!(
            flow.id = %flow.flow_id,
            flow.type = %flow.flow_type,
            flow.key = %flow.business_key,
            step = ?error.step(),
            "Flow failed: {}",
            error_msg
        );

        match storage
            .complete_flow(flow.task_id, TaskStatus::Failed, Some(error_msg.clone()))
            .await
        {
            Ok(true) => {
                Self::notify_parent(storage, flow, ChildCompletion::failed(error_msg)).await;
            }
            Ok(false) => debug!("Flow {} had already finished", flow.flow_id),
            Err(e) => error!("Worker {} failed to mark flow failed: {}", worker_id, e),
        }
    }

    /// Runs one dequeued flow and records its outcome.
    async fn run_flow(
        storage: Arc<S>,
        registry: Arc<RwLock<Registry<S>>>,
        activities: Arc<ActivityExecutor>,
        worker_id: String,
        retry_policy: RetryPolicy,
        flow: ScheduledFlow,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        // Held for the whole run
        let _permit = permit;

        let executor = {
            let registry = registry.read().await;
            registry.get_executor(&flow.flow_type)
        };

        let outcome = match executor {
            Some(exec) => {
                let run = exec(
                    flow.flow_data.clone(),
                    flow.flow_id,
                    storage.clone(),
                    activities,
                );
                // Own task so a panicking flow fails its instance, not the worker
                match tokio::spawn(run).await {
                    Ok(outcome) => outcome,
                    Err(e) => FlowOutcome::Completed(Err(ExecutionError::TaskPanic(e.to_string()))),
                }
            }
            None => FlowOutcome::Completed(Err(ExecutionError::NonRetryable(format!(
                "no executor registered for type: {}",
                flow.flow_type
            )))),
        };

        match outcome {
            FlowOutcome::Suspended(reason) => {
                Self::handle_suspended_flow(&storage, &worker_id, &flow, reason).await;
            }
            FlowOutcome::Completed(Ok(())) => {
                Self::handle_flow_completion(&storage, &worker_id, &flow).await;
            }
            FlowOutcome::Completed(Err(error)) => {
                Self::handle_flow_error(&storage, &worker_id, &flow, error, retry_policy).await;
            }
        }
    }

    /// Starts the worker in the background.
    ///
    /// Flows still locked by this worker id (left RUNNING by a crashed
    /// process with the same id) are released first, so they run again.
    ///
    /// # Errors
    /// `ConfigError::Invalid` if the settings, builder overrides included,
    /// do not pass [`WorkerConfig::validate`].
    pub async fn start(self) -> Result<WorkerHandle, ConfigError> {
        self.config.validate()?;

        let cancellation_token = CancellationToken::new();
        let worker_token = cancellation_token.clone();
        let worker_id_for_handle = self.worker_id.clone();

        info!("Starting worker: {}", self.worker_id);

        match self.storage.release_locks(&self.worker_id).await {
            Ok(0) => {}
            Ok(n) => info!("Worker {} released {} interrupted flows", self.worker_id, n),
            Err(e) => warn!("Worker {} failed to release locks: {}", self.worker_id, e),
        }

        let loop_span = self
            .tracing_state
            .worker_loop_span(&self.worker_id)
            .unwrap_or_else(tracing::Span::none);

        let handle = tokio::spawn(
            async move {
                let mut active_flows: JoinSet<()> = JoinSet::new();
                let retry_policy = self.config.flow_retry_policy();
                let flow_slots = self
                    .config
                    .max_concurrent_flows
                    .map(|max| Arc::new(Semaphore::new(max)));

                let mut maintenance = tokio::time::interval(self.config.timer_interval);
                maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                // Exactly one dequeue in flight at a time
                let (dequeue_tx, mut dequeue_rx) = tokio::sync::mpsc::unbounded_channel();

                let dequeue_storage = self.storage.clone();
                let dequeue_worker_id = self.worker_id.clone();
                let dequeue_token = worker_token.child_token();
                let dequeue_notify = self.work_notify.clone();
                let poll_interval = self.config.poll_interval;
                let dequeue_task = tokio::spawn(async move {
                    loop {
                        // Take a slot before locking a flow, so nothing sits
                        // RUNNING while waiting for capacity
                        let permit = match &flow_slots {
                            Some(slots) => tokio::select! {
                                biased;
                                _ = dequeue_token.cancelled() => break,
                                permit = slots.clone().acquire_owned() => match permit {
                                    Ok(permit) => Some(permit),
                                    Err(_) => break,
                                },
                            },
                            None => None,
                        };

                        let result = tokio::select! {
                            biased;
                            _ = dequeue_token.cancelled() => break,
                            result = dequeue_storage.dequeue_flow(&dequeue_worker_id) => result,
                        };

                        let got_task = matches!(&result, Ok(Some(_)));
                        let message = result.map(|flow| flow.map(|flow| (flow, permit)));
                        if dequeue_tx.send(message).is_err() {
                            break;
                        }

                        // No work: wait for a wakeup, bounded by the poll interval
                        if !got_task {
                            tokio::select! {
                                biased;
                                _ = dequeue_token.cancelled() => break,
                                _ = tokio::time::timeout(
                                    poll_interval,
                                    dequeue_notify.notified(),
                                ) => {}
                            }
                        }
                    }
                });

                loop {
                    tokio::select! {
                        biased;

                        _ = worker_token.cancelled() => {
                            info!("Worker {} received shutdown signal", self.worker_id);
                            break;
                        }

                        _ = maintenance.tick() => {
                            let span = self
                                .tracing_state
                                .timer_processing_span(&self.worker_id)
                                .unwrap_or_else(tracing::Span::none);
                            async {
                                Self::process_timers(&self.storage).await;
                                Self::process_overdue(&self.storage).await;
                            }
                            .instrument(span)
                            .await;
                        }

                        Some(result) = dequeue_rx.recv() => {
                            // Reap completed flow tasks (non-blocking)
                            while let Some(joined) = active_flows.try_join_next() {
                                if let Err(e) = joined {
                                    error!("Worker {} flow task failed: {}", self.worker_id, e);
                                }
                            }

                            match result {
                                Ok(Some((flow, permit))) => {
                                    let span = self
                                        .tracing_state
                                        .flow_execution_span(&self.worker_id, &flow)
                                        .unwrap_or_else(tracing::Span::none);
                                    let task = Self::run_flow(
                                        self.storage.clone(),
                                        self.registry.clone(),
                                        self.activities.clone(),
                                        self.worker_id.clone(),
                                        retry_policy,
                                        flow,
                                        permit,
                                    );
                                    active_flows.spawn(task.instrument(span));
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(
                                        "Worker {} failed to dequeue flow: {}",
                                        self.worker_id, e
                                    );
                                }
                            }
                        }
                    }
                }

                // A dequeue racing the shutdown may still lock a flow
                if let Err(e) = dequeue_task.await {
                    error!("Worker {} dequeue task failed: {}", self.worker_id, e);
                }
                drop(dequeue_rx);

                // Gracefully wait for all in-flight flows to complete
                let in_flight_count = active_flows.len();
                if in_flight_count > 0 {
                    info!(
                        "Worker {} waiting for {} in-flight flows to complete",
                        self.worker_id, in_flight_count
                    );
                    while active_flows.join_next().await.is_some() {}
                }

                // Whatever is still locked by us was dequeued but never run
                match self.storage.release_locks(&self.worker_id).await {
                    Ok(0) => {}
                    Ok(n) => info!("Worker {} handed back {} unstarted flows", self.worker_id, n),
                    Err(e) => warn!("Worker {} failed to release locks: {}", self.worker_id, e),
                }

                info!("Worker {} stopped", self.worker_id);
            }
            .instrument(loop_span),
        );

        Ok(WorkerHandle {
            worker_id: worker_id_for_handle,
            handle,
            cancellation_token,
        })
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns a reference to the cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Stops taking new flows and waits for the ones in flight to finish
    /// their current run.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.handle.await;
    }

    /// Returns true if the worker task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the worker immediately, as a crash would.
    ///
    /// Flows it was running stay RUNNING and locked by this worker id until
    /// a worker with the same id starts again.
    pub fn abort(&self) {
        self.cancellation_token.cancel();
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryExecutionLog;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Clone, Debug, FlowType)]
    #[flow_type(activities(crate::flows::Deliver))]
    struct Needy {
        #[business_key]
        key: String,
    }

    impl Needy {
        async fn run(self: Arc<Self>) -> Result<String, ExecutionError> {
            Ok(self.key.clone())
        }
    }

    #[tokio::test]
    async fn test_register_requires_activities() {
        let storage = Arc::new(InMemoryExecutionLog::new());
        let worker = Worker::new(storage, "test-worker");

        let err = worker
            .register(|flow: Arc<Needy>| flow.run())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::MissingActivities {
                flow_type: "Needy".to_string(),
                missing: vec!["deliver".to_string()],
            }
        );
        assert!(worker.registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_flow() {
        let mut registry: Registry<InMemoryExecutionLog> = Registry::new();
        registry.register(|flow: Arc<Needy>| flow.run()).unwrap();
        assert_eq!(
            registry.register(|flow: Arc<Needy>| flow.run()),
            Err(RegistrationError::DuplicateFlow("Needy".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_builder_overrides_config() {
        let storage = Arc::new(InMemoryExecutionLog::new());
        let worker = Worker::new(storage, "w")
            .with_poll_interval(Duration::from_millis(10))
            .with_timer_interval(Duration::from_millis(5))
            .with_max_concurrent_flows(2)
            .with_structured_tracing();
        assert_eq!(worker.config().poll_interval, Duration::from_millis(10));
        assert_eq!(worker.config().timer_interval, Duration::from_millis(5));
        assert_eq!(worker.config().max_concurrent_flows, Some(2));
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let storage = Arc::new(InMemoryExecutionLog::new());
        let handle = Worker::new(storage, "w")
            .with_poll_interval(Duration::from_millis(10))
            .start()
            .await
            .unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.worker_id(), "w");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_overrides() {
        let storage = Arc::new(InMemoryExecutionLog::new());

        let zero_timer = Worker::new(storage.clone(), "w")
            .with_timer_interval(Duration::ZERO)
            .start()
            .await;
        assert!(matches!(zero_timer, Err(ConfigError::Invalid(_))));

        let no_slots = Worker::new(storage.clone(), "w")
            .with_max_concurrent_flows(0)
            .start()
            .await;
        assert!(matches!(no_slots, Err(ConfigError::Invalid(_))));

        let config = WorkerConfig {
            poll_interval: Duration::ZERO,
            ..WorkerConfig::default()
        };
        let zero_poll = Worker::with_config(storage, "w", config).start().await;
        assert!(matches!(zero_poll, Err(ConfigError::Invalid(_))));
    }
}
