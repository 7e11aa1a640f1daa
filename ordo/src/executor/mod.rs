//! Execution engine for ordo flows.
//!
//! This module hides how a flow is run:
//! - [`ExecutionContext`]: step numbering and replay validation, scoped task-locally
//! - [`FlowInstance`]: one run of a flow method, ending in completion or suspension
//! - [`execute_activity`]: side effects under schedule-to-start, start-to-close
//!   and heartbeat budgets, with retry
//! - [`sleep`], [`receive_signal`], [`InvokeChild::invoke`]: the durable waits
//! - [`Worker`]: the loop that dequeues instances, fires timers and reports
//!   finished children to their parents
//! - [`Client`]: start, signal and query from outside a flow
//!
//! Every durable primitive is one numbered step in the instance's history.
//! Re-running a flow replays completed steps from that history, so a flow
//! method must make the same calls in the same order on every run.

mod activity;
mod child_flow;
mod client;
mod config;
mod context;
mod error;
mod instance;
mod signal;
mod timer;
mod worker;

pub use activity::{
    execute_activity, Activity, ActivityContext, ActivityError, ActivityExecutor, ActivityFailure,
    ActivityOptions, ActivityRegistry,
};
pub use child_flow::{ChildCompletion, InvokeChild, PendingChild};
pub use client::{Client, FlowStatus};
pub use config::{ConfigError, WorkerConfig};
pub use context::{current_context, is_replaying, ExecutionContext};
pub use error::{
    ClientError, ExecutionError, FlowOutcome, RegistrationError, Result, SuspendReason,
};
pub use instance::FlowInstance;
pub use signal::{receive_signal, receive_signal_named, SignalType};
pub use timer::{sleep, sleep_named};
pub use worker::{
    Registry, TracingBehavior, WithStructuredTracing, WithoutStructuredTracing, Worker,
    WorkerHandle,
};
