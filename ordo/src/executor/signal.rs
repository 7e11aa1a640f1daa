//! External signal handling module.
//!
//! A signal is a named message from outside the flow (a person, another
//! service). Senders append to the instance's durable inbox, which is FIFO
//! per signal name; a receiving step pops the oldest matching message and
//! completes itself with it in one storage operation. Each message is
//! therefore consumed by exactly one receive, and a message sent before the
//! flow reached its receive point waits in the inbox until it does.
//!
//! The wait is unbounded: a flow parked on a signal stays SUSPENDED until a
//! message arrives.

use super::context::current_context;
use super::error::{Result, SuspendReason};
use crate::core::{deserialize_value, InvocationStatus, StepKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// A typed signal with a fixed name.
///
/// ```
/// use ordo::executor::SignalType;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Approval {
///     approved: bool,
/// }
///
/// impl SignalType for Approval {
///     const NAME: &'static str = "approval";
/// }
/// ```
pub trait SignalType: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;
}

/// Waits for the next `S` signal and returns its payload.
///
/// # Errors
/// `ExecutionError::Suspended` while no message is queued (the flow must
/// propagate it with `?`), or a storage/deserialization error.
pub async fn receive_signal<S: SignalType>() -> Result<S> {
    receive_signal_named(S::NAME).await
}

/// Waits for the next signal called `name` and decodes it as `T`.
pub async fn receive_signal_named<T: DeserializeOwned>(name: &str) -> Result<T> {
    let ctx = current_context()?;
    let claimed = ctx.claim_step(StepKind::Signal, name, &name, None).await?;
    let step = claimed.step;

    if let Some(inv) = claimed.existing.as_ref().filter(|inv| inv.is_complete()) {
        if let Some(bytes) = inv.return_value() {
            return Ok(deserialize_value(bytes)?);
        }
    }

    let waiting = claimed
        .existing
        .as_ref()
        .is_some_and(|inv| inv.status() == InvocationStatus::WaitingForSignal);
    if !waiting {
        ctx.storage.log_signal(ctx.id, step, name).await?;
    }

    match ctx.storage.consume_signal(ctx.id, step, name).await? {
        Some(bytes) => {
            debug!("Flow {} step {} received signal '{}'", ctx.id, step, name);
            Ok(deserialize_value(&bytes)?)
        }
        None => Err(ctx.suspend(SuspendReason::Signal {
            flow_id: ctx.id,
            step,
            signal_name: name.to_string(),
        })),
    }
}
