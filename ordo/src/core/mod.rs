//! Core types and utilities for the ordo orchestration engine.
//!
//! # Domain Model
//! - [`Invocation`]: one numbered step of a flow instance's history
//! - [`InvocationStatus`]: the execution state of a step
//! - [`StepKind`]: what a step records (flow, activity, timer, signal, child)
//! - [`FlowType`] / [`InvokableFlow`]: stable names and business keys, usually
//!   written with `#[derive(FlowType)]`
//!
//! # Serialization
//! - [`serialize_value`] / [`deserialize_value`]: JSON encoding of persisted payloads
//! - [`hash_params`] / [`fingerprint`]: stable fingerprints for replay validation
//!
//! # Retry Behavior
//! - [`RetryPolicy`]: attempts and backoff
//! - [`Retryable`]: which errors are worth another attempt
//!
//! # Example
//!
//! ```
//! use ordo::core::{fingerprint, Invocation, InvocationStatus, StepKind};
//! use uuid::Uuid;
//! use chrono::Utc;
//!
//! let (params, hash) = fingerprint(&"order-1").unwrap();
//! let invocation = Invocation::new(
//!     Uuid::new_v4(),
//!     1,
//!     Utc::now(),
//!     StepKind::Activity,
//!     "receive-ack".to_string(),
//!     InvocationStatus::Pending,
//!     1,
//!     params,
//!     hash,
//!     None,
//! );
//! assert!(!invocation.is_complete());
//! ```

mod error;
mod flow_type;
mod invocation;
pub mod retry;
mod serialization;

pub use error::{CoreError, Result};
pub use flow_type::{flow_id_for, flow_id_of, FlowType, InvokableFlow};
pub use ordo_macros::FlowType;
pub use invocation::{Invocation, InvocationStatus, StepKind};
pub use retry::{retry_with_policy, RetryPolicy, Retryable};
pub use serialization::{deserialize_value, fingerprint, hash_params, serialize_value};
