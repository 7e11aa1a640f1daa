use super::{
    error::Result, error::StorageError, params::InvocationStartParams, ExecutionLog,
    ScheduledFlow, TaskStatus, TimerInfo,
};
use crate::core::{hash_params, serialize_value, Invocation, InvocationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

/// In-memory execution log using DashMap for concurrent access.
///
/// Suitable for tests, demos and single-process runs: state is lost when the
/// process exits, but the flow queue, timers and signal inbox behave like the
/// persistent backend, so a worker can be stopped and restarted against the
/// same instance to exercise recovery.
pub struct InMemoryExecutionLog {
    /// Step history keyed by (flow_id, step)
    invocations: DashMap<(Uuid, i32), Invocation>,
    /// Scheduled flows keyed by task_id
    flow_queue: DashMap<Uuid, ScheduledFlow>,
    /// flow_id -> task_id index
    flow_task_map: DashMap<Uuid, Uuid>,
    /// Per-instance FIFO of (signal name, payload)
    signal_inbox: DashMap<Uuid, VecDeque<(String, Vec<u8>)>>,
    /// Ready task ids in arrival order
    pending_tx: mpsc::UnboundedSender<Uuid>,
    pending_rx: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    /// Wakes workers when new work arrives
    work_notify: Arc<Notify>,
    /// Wakes waiters when a flow reaches a terminal status
    status_notify: Arc<Notify>,
}

impl InMemoryExecutionLog {
    /// Creates a new in-memory execution log.
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            invocations: DashMap::new(),
            flow_queue: DashMap::new(),
            flow_task_map: DashMap::new(),
            signal_inbox: DashMap::new(),
            pending_tx,
            pending_rx: Arc::new(Mutex::new(pending_rx)),
            work_notify: Arc::new(Notify::new()),
            status_notify: Arc::new(Notify::new()),
        }
    }

    fn make_ready(&self, task_id: Uuid) -> Result<()> {
        self.pending_tx
            .send(task_id)
            .map_err(|_| StorageError::Connection("pending channel closed".to_string()))?;
        self.work_notify.notify_one();
        Ok(())
    }

    /// Makes a task ready once `delay` has passed.
    fn make_ready_after(&self, task_id: Uuid, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self.make_ready(task_id);
        }

        let tx = self.pending_tx.clone();
        let notify = self.work_notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(task_id).is_ok() {
                notify.notify_one();
            }
        });
        Ok(())
    }
}

impl Default for InMemoryExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionLog for InMemoryExecutionLog {
    async fn log_invocation_start(&self, params: InvocationStartParams<'_>) -> Result<()> {
        let InvocationStartParams {
            id,
            step,
            kind,
            name,
            status,
            parameters,
            retry_policy,
        } = params;

        match self.invocations.entry((id, step)) {
            Entry::Occupied(mut existing) => {
                // Never overwrite a cached result or a suspended wait
                if existing.get().status() == InvocationStatus::Pending {
                    existing.get_mut().increment_attempts();
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Invocation::new(
                    id,
                    step,
                    Utc::now(),
                    kind,
                    name.to_string(),
                    status,
                    1,
                    parameters.to_vec(),
                    hash_params(parameters),
                    retry_policy,
                ));
            }
        }
        Ok(())
    }

    async fn log_invocation_completion(
        &self,
        id: Uuid,
        step: i32,
        return_value: &[u8],
    ) -> Result<Invocation> {
        let mut entry = self
            .invocations
            .get_mut(&(id, step))
            .ok_or(StorageError::InvocationNotFound { id, step })?;
        entry.complete(return_value.to_vec());
        Ok(entry.clone())
    }

    async fn get_invocation(&self, id: Uuid, step: i32) -> Result<Option<Invocation>> {
        Ok(self
            .invocations
            .get(&(id, step))
            .map(|entry| entry.value().clone()))
    }

    async fn get_invocations_for_flow(&self, id: Uuid) -> Result<Vec<Invocation>> {
        let mut invocations: Vec<Invocation> = self
            .invocations
            .iter()
            .filter(|entry| entry.key().0 == id)
            .map(|entry| entry.value().clone())
            .collect();

        invocations.sort_by_key(|inv| inv.step());
        Ok(invocations)
    }

    async fn log_timer(
        &self,
        flow_id: Uuid,
        step: i32,
        fire_at: DateTime<Utc>,
        timer_name: Option<&str>,
    ) -> Result<()> {
        let mut entry = self
            .invocations
            .get_mut(&(flow_id, step))
            .ok_or(StorageError::InvocationNotFound { id: flow_id, step })?;
        entry.set_status(InvocationStatus::WaitingForTimer);
        entry.set_fire_at(Some(fire_at));
        entry.set_await_key(timer_name.map(|s| s.to_string()));
        Ok(())
    }

    async fn get_expired_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerInfo>> {
        let mut timers: Vec<TimerInfo> = self
            .invocations
            .iter()
            .filter(|entry| {
                entry.value().status() == InvocationStatus::WaitingForTimer
                    && entry.value().is_timer_expired(now)
            })
            .filter_map(|entry| {
                let inv = entry.value();
                inv.fire_at().map(|fire_at| TimerInfo {
                    flow_id: inv.id(),
                    step: inv.step(),
                    fire_at,
                    timer_name: inv.await_key().map(|s| s.to_string()),
                })
            })
            .collect();

        timers.sort_by_key(|t| t.fire_at);
        Ok(timers)
    }

    async fn claim_timer(&self, flow_id: Uuid, step: i32) -> Result<bool> {
        let fired = serialize_value(&())?;
        if let Some(mut entry) = self.invocations.get_mut(&(flow_id, step)) {
            if entry.status() == InvocationStatus::WaitingForTimer {
                entry.complete(fired);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn log_signal(&self, flow_id: Uuid, step: i32, await_key: &str) -> Result<()> {
        let mut entry = self
            .invocations
            .get_mut(&(flow_id, step))
            .ok_or(StorageError::InvocationNotFound { id: flow_id, step })?;
        entry.set_status(InvocationStatus::WaitingForSignal);
        entry.set_await_key(Some(await_key.to_string()));
        Ok(())
    }

    async fn push_signal(&self, flow_id: Uuid, name: &str, payload: &[u8]) -> Result<()> {
        self.signal_inbox
            .entry(flow_id)
            .or_default()
            .push_back((name.to_string(), payload.to_vec()));
        debug!("Queued signal '{}' for flow {}", name, flow_id);
        Ok(())
    }

    async fn consume_signal(
        &self,
        flow_id: Uuid,
        step: i32,
        name: &str,
    ) -> Result<Option<Vec<u8>>> {
        // Lock order: invocation entry first, then inbox
        let mut inv = self
            .invocations
            .get_mut(&(flow_id, step))
            .ok_or(StorageError::InvocationNotFound { id: flow_id, step })?;

        if inv.is_complete() {
            return Ok(inv.return_value().map(|v| v.to_vec()));
        }

        let payload = {
            let Some(mut inbox) = self.signal_inbox.get_mut(&flow_id) else {
                return Ok(None);
            };
            let Some(position) = inbox.iter().position(|(queued, _)| queued == name) else {
                return Ok(None);
            };
            inbox.remove(position).map(|(_, payload)| payload)
        };

        let Some(payload) = payload else {
            return Ok(None);
        };
        inv.complete(payload.clone());
        Ok(Some(payload))
    }

    async fn has_pending_signal(&self, flow_id: Uuid, name: &str) -> Result<bool> {
        Ok(self
            .signal_inbox
            .get(&flow_id)
            .is_some_and(|inbox| inbox.iter().any(|(queued, _)| queued == name)))
    }

    async fn complete_waiting_step(
        &self,
        flow_id: Uuid,
        await_key: &str,
        payload: &[u8],
    ) -> Result<bool> {
        // Find first, then lock: holding an iterator while calling get_mut
        // on the same map deadlocks.
        let step = self
            .invocations
            .iter()
            .find(|entry| entry.key().0 == flow_id && entry.value().is_waiting_on(await_key))
            .map(|entry| entry.key().1);

        let Some(step) = step else {
            return Ok(false);
        };

        if let Some(mut entry) = self.invocations.get_mut(&(flow_id, step)) {
            if entry.is_waiting_on(await_key) {
                entry.complete(payload.to_vec());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn enqueue_flow(&self, flow: ScheduledFlow) -> Result<Uuid> {
        let task_id = flow.task_id;
        let flow_id = flow.flow_id;

        match self.flow_task_map.entry(flow_id) {
            Entry::Occupied(_) => return Err(StorageError::DuplicateFlow(flow_id)),
            Entry::Vacant(slot) => {
                slot.insert(task_id);
            }
        }
        self.flow_queue.insert(task_id, flow);
        self.make_ready(task_id)?;

        Ok(task_id)
    }

    async fn dequeue_flow(&self, worker_id: &str) -> Result<Option<ScheduledFlow>> {
        let mut rx = self.pending_rx.lock().await;

        loop {
            let Ok(task_id) = rx.try_recv() else {
                return Ok(None);
            };

            let now = Utc::now();
            let Some(mut entry) = self.flow_queue.get_mut(&task_id) else {
                continue;
            };

            // Stale ids (already claimed, suspended, finished) are skipped
            if entry.status != TaskStatus::Pending {
                continue;
            }

            if let Some(scheduled_for) = entry.scheduled_for.filter(|at| *at > now) {
                let wait = (scheduled_for - now).to_std().unwrap_or_default();
                drop(entry);
                self.make_ready_after(task_id, wait)?;
                continue;
            }

            entry.status = TaskStatus::Running;
            entry.locked_by = Some(worker_id.to_string());
            entry.updated_at = now;
            return Ok(Some(entry.clone()));
        }
    }

    async fn suspend_flow(&self, task_id: Uuid) -> Result<bool> {
        let mut entry = self
            .flow_queue
            .get_mut(&task_id)
            .ok_or(StorageError::ScheduledFlowNotFound(task_id))?;

        if entry.status != TaskStatus::Running {
            return Ok(false);
        }
        entry.status = TaskStatus::Suspended;
        entry.locked_by = None;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn resume_flow(&self, flow_id: Uuid) -> Result<bool> {
        let Some(task_id) = self.flow_task_map.get(&flow_id).map(|v| *v) else {
            return Ok(false);
        };

        {
            let Some(mut entry) = self.flow_queue.get_mut(&task_id) else {
                return Ok(false);
            };
            if entry.status != TaskStatus::Suspended {
                return Ok(false);
            }
            entry.status = TaskStatus::Pending;
            entry.updated_at = Utc::now();
        }

        self.make_ready(task_id)?;
        Ok(true)
    }

    async fn complete_flow(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<bool> {
        let flow_id = {
            let mut entry = self
                .flow_queue
                .get_mut(&task_id)
                .ok_or(StorageError::ScheduledFlowNotFound(task_id))?;

            if entry.is_finished() {
                return Ok(false);
            }
            entry.status = status;
            entry.locked_by = None;
            entry.updated_at = Utc::now();
            if error_message.is_some() {
                entry.error_message = error_message;
            }
            entry.flow_id
        };

        // Nothing receives once the instance is finished
        self.signal_inbox.remove(&flow_id);

        self.status_notify.notify_waiters();
        Ok(true)
    }

    async fn retry_flow(
        &self,
        task_id: Uuid,
        error_message: String,
        delay: Duration,
    ) -> Result<()> {
        let chrono_delay = chrono::Duration::from_std(delay)
            .map_err(|e| StorageError::InvalidParameter(format!("Invalid delay duration: {}", e)))?;

        {
            let mut entry = self
                .flow_queue
                .get_mut(&task_id)
                .ok_or(StorageError::ScheduledFlowNotFound(task_id))?;
            entry.retry_count += 1;
            entry.error_message = Some(error_message);
            entry.status = TaskStatus::Pending;
            entry.locked_by = None;
            entry.scheduled_for = Some(Utc::now() + chrono_delay);
            entry.updated_at = Utc::now();
        }

        self.make_ready_after(task_id, delay)
    }

    async fn get_scheduled_flow(&self, task_id: Uuid) -> Result<Option<ScheduledFlow>> {
        Ok(self.flow_queue.get(&task_id).map(|entry| entry.clone()))
    }

    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<ScheduledFlow>> {
        let Some(task_id) = self.flow_task_map.get(&flow_id).map(|v| *v) else {
            return Ok(None);
        };
        Ok(self.flow_queue.get(&task_id).map(|entry| entry.clone()))
    }

    async fn get_overdue_flows(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledFlow>> {
        Ok(self
            .flow_queue
            .iter()
            .filter(|entry| entry.value().is_overdue(now))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn release_locks(&self, worker_id: &str) -> Result<u64> {
        let locked: Vec<Uuid> = self
            .flow_queue
            .iter()
            .filter(|entry| {
                entry.status == TaskStatus::Running
                    && entry.locked_by.as_deref() == Some(worker_id)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut released = 0;
        for task_id in locked {
            let claimed = match self.flow_queue.get_mut(&task_id) {
                Some(mut entry) if entry.status == TaskStatus::Running => {
                    entry.status = TaskStatus::Pending;
                    entry.locked_by = None;
                    entry.updated_at = Utc::now();
                    true
                }
                _ => false,
            };
            if claimed {
                self.make_ready(task_id)?;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn reset(&self) -> Result<()> {
        self.invocations.clear();
        self.flow_queue.clear();
        self.flow_task_map.clear();
        self.signal_inbox.clear();

        let mut rx = self.pending_rx.lock().await;
        while rx.try_recv().is_ok() {}

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn work_notify(&self) -> Option<Arc<Notify>> {
        Some(self.work_notify.clone())
    }

    fn status_notify(&self) -> Option<Arc<Notify>> {
        Some(self.status_notify.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{deserialize_value, StepKind};

    fn scheduled(key: &str) -> ScheduledFlow {
        ScheduledFlow::new(
            Uuid::new_v4(),
            "TestFlow".to_string(),
            key.to_string(),
            vec![1, 2, 3],
        )
    }

    async fn start_step(
        log: &InMemoryExecutionLog,
        id: Uuid,
        step: i32,
        kind: StepKind,
        name: &str,
    ) {
        log.log_invocation_start(InvocationStartParams {
            id,
            step,
            kind,
            name,
            status: InvocationStatus::Pending,
            parameters: &[],
            retry_policy: None,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_and_get_flow() {
        let log = InMemoryExecutionLog::new();
        let flow = scheduled("o-1");
        let task_id = flow.task_id;
        let flow_id = flow.flow_id;

        let returned_id = log.enqueue_flow(flow).await.unwrap();
        assert_eq!(returned_id, task_id);

        let retrieved = log.get_scheduled_flow(task_id).await.unwrap().unwrap();
        assert_eq!(retrieved.flow_id, flow_id);
        assert_eq!(retrieved.business_key, "o-1");
        assert_eq!(retrieved.status, TaskStatus::Pending);

        let by_flow = log.get_flow(flow_id).await.unwrap().unwrap();
        assert_eq!(by_flow.task_id, task_id);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_flow_id() {
        let log = InMemoryExecutionLog::new();
        let flow = scheduled("o-1");
        let mut again = scheduled("o-1");
        again.flow_id = flow.flow_id;

        log.enqueue_flow(flow).await.unwrap();
        let result = log.enqueue_flow(again).await;
        assert!(matches!(result, Err(StorageError::DuplicateFlow(_))));
    }

    #[tokio::test]
    async fn test_dequeue_locks_flow() {
        let log = InMemoryExecutionLog::new();
        let flow = scheduled("o-1");
        let task_id = flow.task_id;
        log.enqueue_flow(flow).await.unwrap();

        let dequeued = log.dequeue_flow("worker-1").await.unwrap().unwrap();
        assert_eq!(dequeued.task_id, task_id);
        assert_eq!(dequeued.status, TaskStatus::Running);
        assert_eq!(dequeued.locked_by, Some("worker-1".to_string()));

        assert!(log.dequeue_flow("worker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_fifo_order() {
        let log = InMemoryExecutionLog::new();
        let first = scheduled("o-1");
        let first_id = first.task_id;
        log.enqueue_flow(first).await.unwrap();
        log.enqueue_flow(scheduled("o-2")).await.unwrap();
        log.enqueue_flow(scheduled("o-3")).await.unwrap();

        let dequeued = log.dequeue_flow("worker-1").await.unwrap().unwrap();
        assert_eq!(dequeued.task_id, first_id);
    }

    #[tokio::test]
    async fn test_complete_flow_first_terminal_status_wins() {
        let log = InMemoryExecutionLog::new();
        let flow = scheduled("o-1");
        let task_id = flow.task_id;
        log.enqueue_flow(flow).await.unwrap();
        log.dequeue_flow("worker-1").await.unwrap();

        assert!(log
            .complete_flow(task_id, TaskStatus::Failed, Some("deadline exceeded".into()))
            .await
            .unwrap());
        assert!(!log
            .complete_flow(task_id, TaskStatus::Complete, None)
            .await
            .unwrap());

        let flow = log.get_scheduled_flow(task_id).await.unwrap().unwrap();
        assert_eq!(flow.status, TaskStatus::Failed);
        assert_eq!(flow.error_message.as_deref(), Some("deadline exceeded"));
    }

    #[tokio::test]
    async fn test_finishing_flow_drops_queued_signals() {
        let log = InMemoryExecutionLog::new();
        let flow = scheduled("o-2");
        let (task_id, flow_id) = (flow.task_id, flow.flow_id);
        log.enqueue_flow(flow).await.unwrap();
        log.dequeue_flow("worker-1").await.unwrap();

        log.push_signal(flow_id, "order-decision", b"late").await.unwrap();
        assert!(log.has_pending_signal(flow_id, "order-decision").await.unwrap());

        log.complete_flow(task_id, TaskStatus::Complete, None)
            .await
            .unwrap();
        assert!(!log.has_pending_signal(flow_id, "order-decision").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_nonexistent_flow() {
        let log = InMemoryExecutionLog::new();
        let result = log
            .complete_flow(Uuid::new_v4(), TaskStatus::Complete, None)
            .await;
        assert!(matches!(
            result.unwrap_err(),
            StorageError::ScheduledFlowNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let log = InMemoryExecutionLog::new();
        let flow = scheduled("o-1");
        let (task_id, flow_id) = (flow.task_id, flow.flow_id);
        log.enqueue_flow(flow).await.unwrap();

        // Not suspended yet
        assert!(!log.resume_flow(flow_id).await.unwrap());

        log.dequeue_flow("worker-1").await.unwrap().unwrap();
        assert!(!log.resume_flow(flow_id).await.unwrap());
        assert!(log.suspend_flow(task_id).await.unwrap());
        assert!(log.dequeue_flow("worker-1").await.unwrap().is_none());

        assert!(log.resume_flow(flow_id).await.unwrap());
        let again = log.dequeue_flow("worker-1").await.unwrap().unwrap();
        assert_eq!(again.task_id, task_id);
    }

    #[tokio::test]
    async fn test_retry_flow_is_delayed() {
        let log = InMemoryExecutionLog::new();
        let flow = scheduled("o-1");
        let task_id = flow.task_id;
        log.enqueue_flow(flow).await.unwrap();
        log.dequeue_flow("worker-1").await.unwrap().unwrap();

        log.retry_flow(task_id, "storage hiccup".into(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(log.dequeue_flow("worker-1").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let retried = log.dequeue_flow("worker-1").await.unwrap().unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.error_message.as_deref(), Some("storage hiccup"));
    }

    #[tokio::test]
    async fn test_release_locks_only_for_worker() {
        let log = InMemoryExecutionLog::new();
        log.enqueue_flow(scheduled("o-1")).await.unwrap();
        log.enqueue_flow(scheduled("o-2")).await.unwrap();
        log.dequeue_flow("worker-a").await.unwrap().unwrap();
        log.dequeue_flow("worker-b").await.unwrap().unwrap();

        assert_eq!(log.release_locks("worker-a").await.unwrap(), 1);
        let picked = log.dequeue_flow("worker-a").await.unwrap().unwrap();
        assert_eq!(picked.business_key, "o-1");
    }

    #[tokio::test]
    async fn test_signal_inbox_is_fifo_and_consumed_once() {
        let log = InMemoryExecutionLog::new();
        let flow_id = Uuid::new_v4();
        start_step(&log, flow_id, 2, StepKind::Signal, "order-decision").await;
        log.log_signal(flow_id, 2, "order-decision").await.unwrap();

        assert!(log
            .consume_signal(flow_id, 2, "order-decision")
            .await
            .unwrap()
            .is_none());

        log.push_signal(flow_id, "order-decision", b"\"first\"")
            .await
            .unwrap();
        log.push_signal(flow_id, "order-decision", b"\"second\"")
            .await
            .unwrap();

        let payload = log
            .consume_signal(flow_id, 2, "order-decision")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deserialize_value::<String>(&payload).unwrap(), "first");

        // A repeated receive on the completed step does not consume again
        let replay = log
            .consume_signal(flow_id, 2, "order-decision")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replay, payload);
        assert!(log
            .has_pending_signal(flow_id, "order-decision")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_claim_timer_once() {
        let log = InMemoryExecutionLog::new();
        let flow_id = Uuid::new_v4();
        start_step(&log, flow_id, 1, StepKind::Timer, "accept-delay").await;
        let fire_at = Utc::now() - chrono::Duration::milliseconds(5);
        log.log_timer(flow_id, 1, fire_at, Some("accept-delay"))
            .await
            .unwrap();

        let expired = log.get_expired_timers(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].timer_name.as_deref(), Some("accept-delay"));

        assert!(log.claim_timer(flow_id, 1).await.unwrap());
        assert!(!log.claim_timer(flow_id, 1).await.unwrap());
        assert!(log.get_expired_timers(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_waiting_step_by_key() {
        let log = InMemoryExecutionLog::new();
        let parent = Uuid::new_v4();
        start_step(&log, parent, 3, StepKind::ChildFlow, "DeliverOrder").await;
        log.log_signal(parent, 3, "child-token").await.unwrap();

        assert!(!log
            .complete_waiting_step(parent, "other-token", b"1")
            .await
            .unwrap());
        assert!(log
            .complete_waiting_step(parent, "child-token", b"1")
            .await
            .unwrap());
        assert!(!log
            .complete_waiting_step(parent, "child-token", b"2")
            .await
            .unwrap());

        let step = log.get_invocation(parent, 3).await.unwrap().unwrap();
        assert!(step.is_complete());
        assert_eq!(step.return_value(), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn test_restart_of_pending_step_counts_attempts() {
        let log = InMemoryExecutionLog::new();
        let id = Uuid::new_v4();
        start_step(&log, id, 1, StepKind::Activity, "deliver").await;
        start_step(&log, id, 1, StepKind::Activity, "deliver").await;

        let inv = log.get_invocation(id, 1).await.unwrap().unwrap();
        assert_eq!(inv.attempts(), 2);

        log.log_invocation_completion(id, 1, b"\"ok\"").await.unwrap();
        start_step(&log, id, 1, StepKind::Activity, "deliver").await;
        let inv = log.get_invocation(id, 1).await.unwrap().unwrap();
        assert_eq!(inv.attempts(), 2);
        assert!(inv.is_complete());
    }

    #[tokio::test]
    async fn test_overdue_flows() {
        let log = InMemoryExecutionLog::new();
        let late = scheduled("o-1").with_deadline(Utc::now() - chrono::Duration::seconds(1));
        let on_time = scheduled("o-2").with_deadline(Utc::now() + chrono::Duration::seconds(60));
        log.enqueue_flow(late).await.unwrap();
        log.enqueue_flow(on_time).await.unwrap();

        let overdue = log.get_overdue_flows(Utc::now()).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].business_key, "o-1");
    }

    #[tokio::test]
    async fn test_concurrent_dequeue() {
        let log = Arc::new(InMemoryExecutionLog::new());

        for i in 0..10 {
            log.enqueue_flow(scheduled(&format!("o-{}", i)))
                .await
                .unwrap();
        }

        let mut handles = vec![];
        for worker_id in 1..=3 {
            let log_clone = log.clone();
            handles.push(tokio::spawn(async move {
                let mut count = 0;
                for _ in 0..5 {
                    if log_clone
                        .dequeue_flow(&format!("worker-{}", worker_id))
                        .await
                        .unwrap()
                        .is_some()
                    {
                        count += 1;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                count
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 10);
    }
}
