//! Durable timer implementation.
//!
//! This module hides the complexity of:
//! - Timer persistence and recovery
//! - Fire time calculation and storage
//! - Coordination with the worker's timer pass
//!
//! A timer step records its fire instant once. The flow then suspends; the
//! worker claims the timer once it expires and resumes the flow, which finds
//! the step complete and moves on. A restart never re-arms a recorded timer:
//! if the instant passed while nothing was running, the timer fires as soon
//! as a worker looks.

use super::context::current_context;
use super::error::{ExecutionError, Result, SuspendReason};
use crate::core::{InvocationStatus, StepKind};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::debug;

/// Suspends the flow for `duration`, durably.
///
/// # Errors
/// Returns an error if storage operations fail, or
/// `ExecutionError::Suspended` while the timer has not fired yet (the flow
/// must propagate it with `?`).
///
/// # Example
/// ```ignore
/// async fn run(self: Arc<Self>) -> Result<(), ExecutionError> {
///     sleep(Duration::from_secs(3)).await?;
///     Ok(())
/// }
/// ```
pub async fn sleep(duration: Duration) -> Result<()> {
    sleep_impl(duration, None).await
}

/// Like [`sleep`], with a name that shows up in history and logs.
pub async fn sleep_named(duration: Duration, name: &str) -> Result<()> {
    sleep_impl(duration, Some(name)).await
}

async fn sleep_impl(duration: Duration, name: Option<&str>) -> Result<()> {
    let ctx = current_context()?;
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    let claimed = ctx
        .claim_step(StepKind::Timer, name.unwrap_or("sleep"), &millis, None)
        .await?;
    let step = claimed.step;

    let suspend = || {
        ctx.suspend(SuspendReason::Timer {
            flow_id: ctx.id,
            step,
        })
    };

    match claimed.existing {
        Some(inv) if inv.is_complete() => return Ok(()),
        Some(inv) if inv.status() == InvocationStatus::WaitingForTimer => {
            if !inv.is_timer_expired(Utc::now()) {
                return Err(suspend());
            }
            // Fired while nobody was looking; whoever claims it first completes
            // the step, and either way it is done.
            ctx.storage.claim_timer(ctx.id, step).await?;
            return Ok(());
        }
        _ => {}
    }

    if duration.is_zero() {
        ctx.complete_step(step, &()).await?;
        return Ok(());
    }

    let fire_at = ChronoDuration::from_std(duration)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);

    ctx.storage
        .log_timer(ctx.id, step, fire_at, name)
        .await
        .map_err(ExecutionError::from)?;

    debug!("Flow {} step {} sleeping until {}", ctx.id, step, fire_at);
    Err(suspend())
}
