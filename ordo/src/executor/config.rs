//! Worker configuration.
//!
//! Plain serde struct with defaults for every field, so a JSON file only
//! needs to name what it changes:
//!
//! ```
//! use ordo::executor::WorkerConfig;
//!
//! let config = WorkerConfig::from_json(r#"{ "task_list": "eats-worker-2" }"#).unwrap();
//! assert_eq!(config.domain, "eats");
//! assert_eq!(config.task_list, "eats-worker-2");
//! ```

use crate::core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings of a [`Worker`](super::Worker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Namespace of the flows this worker serves.
    pub domain: String,
    /// Queue name; also the prefix of the worker id.
    pub task_list: String,
    /// Fallback wait between dequeue attempts when no wakeup arrives.
    pub poll_interval: Duration,
    /// How often expired timers and overdue children are checked.
    pub timer_interval: Duration,
    /// Cap on flows running at once. `None` means unbounded.
    pub max_concurrent_flows: Option<usize>,
    /// Cap on activity attempts running at once.
    pub max_concurrent_activities: usize,
    /// Times a flow is re-run after an infrastructure failure.
    pub max_flow_retries: u32,
    /// Delay before the first of those re-runs.
    pub flow_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            domain: "eats".to_string(),
            task_list: "eats-worker".to_string(),
            poll_interval: Duration::from_secs(1),
            timer_interval: Duration::from_millis(100),
            max_concurrent_flows: None,
            max_concurrent_activities: 100,
            max_flow_retries: 3,
            flow_retry_delay: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_list.trim().is_empty() {
            return Err(ConfigError::Invalid("task_list must not be empty".into()));
        }
        if self.poll_interval.is_zero() || self.timer_interval.is_zero() {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if self.max_concurrent_activities == 0 || self.max_concurrent_flows == Some(0) {
            return Err(ConfigError::Invalid("concurrency limits must be positive".into()));
        }
        Ok(())
    }

    /// Backoff used when re-running a flow after an infrastructure failure.
    pub fn flow_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_flow_retries + 1)
            .with_initial_delay(self.flow_retry_delay)
    }

    /// Worker id for the `n`th worker process on this task list.
    pub fn worker_id(&self, n: usize) -> String {
        format!("{}/{}-{}", self.domain, self.task_list, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_mirror_eats_worker() {
        let config = WorkerConfig::default();
        assert_eq!(config.domain, "eats");
        assert_eq!(config.task_list, "eats-worker");
        assert_eq!(config.worker_id(1), "eats/eats-worker-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            WorkerConfig::from_json(r#"{ "max_concurrent_flows": 8, "max_flow_retries": 1 }"#)
                .unwrap();
        assert_eq!(config.max_concurrent_flows, Some(8));
        assert_eq!(config.max_flow_retries, 1);
        assert_eq!(config.flow_retry_policy().max_attempts, 2);
        assert_eq!(config.task_list, "eats-worker");
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            WorkerConfig::from_json(r#"{ "task_list": " " }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            WorkerConfig::from_json(r#"{ "max_concurrent_activities": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            WorkerConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
