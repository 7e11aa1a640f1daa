use super::error::{CoreError, Result};
use super::retry::RetryPolicy;
use super::serialization::deserialize_value;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationStatus {
    Pending,
    WaitingForSignal,
    WaitingForTimer,
    Complete,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "PENDING",
            InvocationStatus::WaitingForSignal => "WAITING_FOR_SIGNAL",
            InvocationStatus::WaitingForTimer => "WAITING_FOR_TIMER",
            InvocationStatus::Complete => "COMPLETE",
        }
    }
}

impl FromStr for InvocationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(InvocationStatus::Pending),
            "WAITING_FOR_SIGNAL" => Ok(InvocationStatus::WaitingForSignal),
            "WAITING_FOR_TIMER" => Ok(InvocationStatus::WaitingForTimer),
            "COMPLETE" => Ok(InvocationStatus::Complete),
            _ => Err(CoreError::InvalidStatus(s.to_string())),
        }
    }
}

/// What a history entry records.
///
/// Step 0 of every instance is the `Flow` entry holding the flow input and,
/// once finished, its result. Every later step is one durable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Flow,
    Activity,
    Timer,
    Signal,
    ChildFlow,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Flow => "FLOW",
            StepKind::Activity => "ACTIVITY",
            StepKind::Timer => "TIMER",
            StepKind::Signal => "SIGNAL",
            StepKind::ChildFlow => "CHILD_FLOW",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "FLOW" => Ok(StepKind::Flow),
            "ACTIVITY" => Ok(StepKind::Activity),
            "TIMER" => Ok(StepKind::Timer),
            "SIGNAL" => Ok(StepKind::Signal),
            "CHILD_FLOW" => Ok(StepKind::ChildFlow),
            _ => Err(CoreError::InvalidStepKind(s.to_string())),
        }
    }
}

/// One entry of a flow instance's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    id: Uuid,
    step: i32,
    timestamp: DateTime<Utc>,
    kind: StepKind,
    name: String,
    status: InvocationStatus,
    attempts: i32,
    parameters: Vec<u8>,
    params_hash: u64,
    return_value: Option<Vec<u8>>,
    #[serde(default)]
    retry_policy: Option<RetryPolicy>,
    /// When the timer fires (WAITING_FOR_TIMER)
    #[serde(default)]
    fire_at: Option<DateTime<Utc>>,
    /// Timer name, signal name or child completion token this step waits on
    #[serde(default)]
    await_key: Option<String>,
}

impl Invocation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        step: i32,
        timestamp: DateTime<Utc>,
        kind: StepKind,
        name: String,
        status: InvocationStatus,
        attempts: i32,
        parameters: Vec<u8>,
        params_hash: u64,
        retry_policy: Option<RetryPolicy>,
    ) -> Self {
        Self {
            id,
            step,
            timestamp,
            kind,
            name,
            status,
            attempts,
            parameters,
            params_hash,
            return_value: None,
            retry_policy,
            fire_at: None,
            await_key: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn step(&self) -> i32 {
        self.step
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> InvocationStatus {
        self.status
    }

    pub fn attempts(&self) -> i32 {
        self.attempts
    }

    pub fn parameters(&self) -> &[u8] {
        &self.parameters
    }

    pub fn params_hash(&self) -> u64 {
        self.params_hash
    }

    pub fn return_value(&self) -> Option<&[u8]> {
        self.return_value.as_deref()
    }

    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry_policy
    }

    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        self.fire_at
    }

    pub fn await_key(&self) -> Option<&str> {
        self.await_key.as_deref()
    }

    pub fn is_flow(&self) -> bool {
        self.step == 0
    }

    pub fn is_complete(&self) -> bool {
        self.status == InvocationStatus::Complete
    }

    pub fn is_timer_expired(&self, now: DateTime<Utc>) -> bool {
        self.fire_at.is_some_and(|fire_at| fire_at <= now)
    }

    /// Returns true if this entry is a suspended wait on `key`.
    pub fn is_waiting_on(&self, key: &str) -> bool {
        self.status == InvocationStatus::WaitingForSignal && self.await_key() == Some(key)
    }

    pub fn set_status(&mut self, status: InvocationStatus) {
        self.status = status;
    }

    pub fn set_return_value(&mut self, return_value: Vec<u8>) {
        self.return_value = Some(return_value);
    }

    pub fn set_fire_at(&mut self, fire_at: Option<DateTime<Utc>>) {
        self.fire_at = fire_at;
    }

    pub fn set_await_key(&mut self, key: Option<String>) {
        self.await_key = key;
    }

    pub fn set_attempts(&mut self, attempts: i32) {
        self.attempts = attempts;
    }

    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Marks the entry complete with the given result bytes.
    pub fn complete(&mut self, return_value: Vec<u8>) {
        self.status = InvocationStatus::Complete;
        self.return_value = Some(return_value);
    }

    pub fn deserialize_parameters<T: DeserializeOwned>(&self) -> Result<T> {
        deserialize_value(&self.parameters)
    }

    pub fn deserialize_return_value<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.return_value {
            Some(bytes) => deserialize_value(bytes).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(step: i32, kind: StepKind, name: &str) -> Invocation {
        Invocation::new(
            Uuid::new_v4(),
            step,
            Utc::now(),
            kind,
            name.to_string(),
            InvocationStatus::Pending,
            1,
            vec![],
            0,
            None,
        )
    }

    #[test]
    fn test_invocation_status_conversion() {
        for status in [
            InvocationStatus::Pending,
            InvocationStatus::WaitingForSignal,
            InvocationStatus::WaitingForTimer,
            InvocationStatus::Complete,
        ] {
            assert_eq!(InvocationStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(
            InvocationStatus::WaitingForSignal.as_str(),
            "WAITING_FOR_SIGNAL"
        );
        assert!(InvocationStatus::from_str("SLEEPING").is_err());
    }

    #[test]
    fn test_step_kind_conversion() {
        assert_eq!(StepKind::from_str("CHILD_FLOW").unwrap(), StepKind::ChildFlow);
        assert_eq!(StepKind::Activity.to_string(), "ACTIVITY");
        assert!(matches!(
            StepKind::from_str("LOOP"),
            Err(CoreError::InvalidStepKind(_))
        ));
    }

    #[test]
    fn test_invocation_is_flow() {
        assert!(invocation(0, StepKind::Flow, "HandleEatsOrder").is_flow());
        assert!(!invocation(1, StepKind::Activity, "receive-ack").is_flow());
    }

    #[test]
    fn test_waiting_on_key() {
        let mut inv = invocation(2, StepKind::Signal, "order-decision");
        assert!(!inv.is_waiting_on("order-decision"));

        inv.set_status(InvocationStatus::WaitingForSignal);
        inv.set_await_key(Some("order-decision".to_string()));
        assert!(inv.is_waiting_on("order-decision"));
        assert!(!inv.is_waiting_on("other"));

        inv.complete(b"{}".to_vec());
        assert!(inv.is_complete());
        assert!(!inv.is_waiting_on("order-decision"));
    }

    #[test]
    fn test_timer_expiry() {
        let mut inv = invocation(3, StepKind::Timer, "accept-delay");
        let now = Utc::now();
        assert!(!inv.is_timer_expired(now));

        inv.set_fire_at(Some(now - chrono::Duration::seconds(1)));
        assert!(inv.is_timer_expired(now));

        inv.set_fire_at(Some(now + chrono::Duration::seconds(10)));
        assert!(!inv.is_timer_expired(now));
    }

    #[test]
    fn test_increment_attempts() {
        let mut inv = invocation(1, StepKind::Activity, "deliver");
        assert_eq!(inv.attempts(), 1);
        inv.increment_attempts();
        inv.increment_attempts();
        assert_eq!(inv.attempts(), 3);
    }
}
