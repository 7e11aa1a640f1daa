//! Ordo: durable order-fulfillment orchestration
//!
//! `ordo` (Latin for "order", "sequence") runs long-lived order flows that
//! survive process restarts. A flow is an ordinary async method; each
//! durable operation it performs is recorded as a numbered step, and after
//! a crash or a wait the method runs again from the top, replaying the
//! recorded steps instead of repeating them.
//!
//! # Features
//!
//! - **Activities**: side effects with schedule-to-start, start-to-close and
//!   heartbeat budgets, plus retry
//! - **Durable timers**: a fire instant recorded once, fired exactly once
//! - **Signals**: named FIFO inboxes per instance, each message consumed by
//!   exactly one receive
//! - **Child flows**: nested instances with their own history and a
//!   completion budget
//! - **Replay validation**: a flow that takes a different path than its
//!   history fails instead of silently diverging
//!
//! # Quick Start
//!
//! ```no_run
//! use ordo::prelude::*;
//! use ordo::flows::{self, HandleEatsOrder, Order, OrderDecision, OrderOutcome};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(InMemoryExecutionLog::new());
//!     let worker = Worker::new(storage.clone(), "eats-worker-1");
//!     flows::register(&worker).await?;
//!     let handle = worker.start().await?;
//!
//!     let client = Client::new(storage);
//!     let order = Order::new("o-1", ["pizza", "cola"]);
//!     let flow_id = client.start(&HandleEatsOrder::new("u-1", order, "r-1")).await?;
//!     client
//!         .signal::<HandleEatsOrder, _>("o-1", &OrderDecision::accept())
//!         .await?;
//!
//!     client.wait_for_completion(flow_id, Duration::from_secs(30)).await?;
//!     let outcome: Option<OrderOutcome> = client.result(flow_id).await?;
//!     println!("{:?}", outcome);
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! Each module hides a design decision that is likely to change:
//!
//! - [`core`]: history records and ids (hides serialization format)
//! - [`storage`]: persistence and the flow queue (hides database choice and schema)
//! - [`executor`]: replay, durable primitives and the worker (hides execution strategy)
//! - [`flows`]: the order handling and delivery flows

// Lets derived impls name `::ordo` from inside this crate too
extern crate self as ordo;

pub mod core;
pub mod executor;
pub mod flows;
pub mod storage;

pub use core::{
    deserialize_value, flow_id_for, serialize_value, CoreError, FlowType, Invocation,
    InvocationStatus, InvokableFlow, Result as CoreResult, RetryPolicy, StepKind,
};

pub use executor::{
    execute_activity, receive_signal, sleep, Activity, ActivityOptions, Client, ExecutionError,
    Result as ExecutionResult, SignalType, Worker, WorkerConfig, WorkerHandle,
};

pub use storage::{
    ExecutionLog, InMemoryExecutionLog, Result as StorageResult, ScheduledFlow, StorageError,
    TaskStatus,
};

#[cfg(feature = "sqlite")]
pub use storage::{PoolConfig, SqliteExecutionLog};

// Re-export dependencies used in public API
pub use async_trait;
pub use serde;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use ordo::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{FlowType, InvokableFlow, RetryPolicy};

    pub use crate::executor::{
        execute_activity, is_replaying, receive_signal, sleep, sleep_named, Activity,
        ActivityContext, ActivityError, ActivityOptions, Client, ClientError, ExecutionError,
        FlowStatus, InvokeChild, SignalType, Worker, WorkerConfig, WorkerHandle,
    };

    pub use crate::storage::{ExecutionLog, InMemoryExecutionLog};

    #[cfg(feature = "sqlite")]
    pub use crate::storage::SqliteExecutionLog;

    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
