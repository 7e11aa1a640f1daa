use crate::core::{InvocationStatus, RetryPolicy, StepKind};
use uuid::Uuid;

/// Parameters for logging the start of a step invocation.
pub struct InvocationStartParams<'a> {
    /// Flow instance ID
    pub id: Uuid,
    /// Step number in the flow
    pub step: i32,
    /// What the step records (checked on replay)
    pub kind: StepKind,
    /// Activity name, timer name, signal name or child flow type (checked on replay)
    pub name: &'a str,
    /// Current invocation status
    pub status: InvocationStatus,
    /// Serialized parameters
    pub parameters: &'a [u8],
    /// Optional retry policy for this step
    pub retry_policy: Option<RetryPolicy>,
}
