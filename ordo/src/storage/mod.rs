//! Storage layer for the ordo orchestration engine.
//!
//! This module provides a trait-based interface for persisting execution state
//! with two backend implementations:
//!
//! - [`InMemoryExecutionLog`]: in-process storage for tests and demos
//! - [`SqliteExecutionLog`]: persistent SQLite storage (feature `sqlite`)
//!
//! Everything that must survive a restart goes through [`ExecutionLog`]: the
//! numbered step history of every flow instance, timer fire instants, the
//! per-instance signal inbox and the flow queue.
//!
//! # Example
//!
//! ```no_run
//! use ordo::storage::{ExecutionLog, InMemoryExecutionLog};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = InMemoryExecutionLog::new();
//! let history = log.get_invocations_for_flow(uuid::Uuid::new_v4()).await?;
//! assert!(history.is_empty());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

mod error;
mod params;
mod queue;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod memory;

pub use error::{Result, StorageError};
pub use memory::InMemoryExecutionLog;
pub use params::InvocationStartParams;
pub use queue::{ScheduledFlow, TaskStatus, TimerInfo};

#[cfg(feature = "sqlite")]
pub use sqlite::{PoolConfig, SqliteExecutionLog};

use crate::core::Invocation;

/// Durable state of all flow instances.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    /// Records the start of a step.
    ///
    /// If the step already exists and is not complete, its attempt counter is
    /// incremented instead. Completed and waiting steps are left untouched.
    async fn log_invocation_start(&self, params: InvocationStartParams<'_>) -> Result<()>;

    /// Marks a step complete with its serialized result.
    async fn log_invocation_completion(
        &self,
        id: Uuid,
        step: i32,
        return_value: &[u8],
    ) -> Result<Invocation>;

    async fn get_invocation(&self, id: Uuid, step: i32) -> Result<Option<Invocation>>;

    /// Full history of one instance, ordered by step.
    async fn get_invocations_for_flow(&self, id: Uuid) -> Result<Vec<Invocation>>;

    // ===== Timers =====

    /// Puts a step into WAITING_FOR_TIMER with its fire instant.
    async fn log_timer(
        &self,
        flow_id: Uuid,
        step: i32,
        fire_at: DateTime<Utc>,
        timer_name: Option<&str>,
    ) -> Result<()>;

    /// Timers still waiting whose fire instant is at or before `now`, oldest first.
    async fn get_expired_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerInfo>>;

    /// Completes a waiting timer step.
    ///
    /// Returns false if the step was no longer waiting, so exactly one
    /// claimant wins.
    async fn claim_timer(&self, flow_id: Uuid, step: i32) -> Result<bool>;

    // ===== Signals =====

    /// Puts a step into WAITING_FOR_SIGNAL on `await_key`.
    async fn log_signal(&self, flow_id: Uuid, step: i32, await_key: &str) -> Result<()>;

    /// Appends a message to the instance's inbox.
    async fn push_signal(&self, flow_id: Uuid, name: &str, payload: &[u8]) -> Result<()>;

    /// Pops the oldest `name` message and completes `step` with it, atomically.
    ///
    /// Returns the payload the step completed with, or `None` when the inbox
    /// holds no such message. If the step is already complete its recorded
    /// value is returned and the inbox is left alone.
    async fn consume_signal(&self, flow_id: Uuid, step: i32, name: &str)
        -> Result<Option<Vec<u8>>>;

    async fn has_pending_signal(&self, flow_id: Uuid, name: &str) -> Result<bool>;

    /// Completes the step of `flow_id` waiting on `await_key` with `payload`.
    ///
    /// Returns false if no step was waiting on that key.
    async fn complete_waiting_step(
        &self,
        flow_id: Uuid,
        await_key: &str,
        payload: &[u8],
    ) -> Result<bool>;

    // ===== Flow queue =====

    /// Adds a new instance. Fails with `DuplicateFlow` if the flow id exists.
    async fn enqueue_flow(&self, flow: ScheduledFlow) -> Result<Uuid>;

    /// Claims the oldest ready PENDING task for `worker_id`.
    async fn dequeue_flow(&self, worker_id: &str) -> Result<Option<ScheduledFlow>>;

    /// RUNNING → SUSPENDED. Returns false if the task was not running.
    async fn suspend_flow(&self, task_id: Uuid) -> Result<bool>;

    /// SUSPENDED → PENDING. Returns false if the instance was not suspended.
    async fn resume_flow(&self, flow_id: Uuid) -> Result<bool>;

    /// Moves a task to a terminal status.
    ///
    /// Returns false if the task had already finished; the first terminal
    /// status wins.
    async fn complete_flow(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<bool>;

    /// Puts a task back to PENDING after `delay`, counting the retry.
    async fn retry_flow(&self, task_id: Uuid, error_message: String, delay: Duration)
        -> Result<()>;

    async fn get_scheduled_flow(&self, task_id: Uuid) -> Result<Option<ScheduledFlow>>;

    /// Queue entry of an instance, by flow id.
    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<ScheduledFlow>>;

    /// Unfinished tasks whose deadline is at or before `now`.
    async fn get_overdue_flows(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledFlow>>;

    /// Returns RUNNING tasks locked by `worker_id` to PENDING.
    ///
    /// Called when a worker starts, so instances interrupted by a crash of the
    /// previous process under the same id are picked up again.
    async fn release_locks(&self, worker_id: &str) -> Result<u64>;

    async fn reset(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Notified when new work becomes available, if the backend can tell.
    fn work_notify(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Notified whenever a task reaches a terminal status, if the backend can tell.
    fn status_notify(&self) -> Option<Arc<Notify>> {
        None
    }
}
