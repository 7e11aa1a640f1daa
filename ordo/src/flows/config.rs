//! Timing settings of the order flows.
//!
//! Both structs are part of the serialized flow, so a started instance keeps
//! the settings it was started with across restarts.

use crate::executor::ActivityOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Pause between accepting an order and starting its delivery.
    pub accept_delay: Duration,
    /// Completion budget of the delivery child flow.
    pub delivery_timeout: Duration,
    /// Options for the order flow's own activities.
    pub activity: ActivityOptions,
    pub delivery: DeliveryConfig,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            accept_delay: Duration::from_secs(3),
            delivery_timeout: Duration::from_secs(5 * 60),
            activity: ActivityOptions::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl OrderConfig {
    pub fn with_accept_delay(mut self, delay: Duration) -> Self {
        self.accept_delay = delay;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_activity_options(mut self, options: ActivityOptions) -> Self {
        self.activity = options;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Time the order spends on the road.
    pub transit_delay: Duration,
    pub activity: ActivityOptions,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            transit_delay: Duration::from_secs(4),
            activity: ActivityOptions::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn with_transit_delay(mut self, delay: Duration) -> Self {
        self.transit_delay = delay;
        self
    }

    pub fn with_activity_options(mut self, options: ActivityOptions) -> Self {
        self.activity = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrderConfig::default();
        assert_eq!(config.accept_delay, Duration::from_secs(3));
        assert_eq!(config.delivery_timeout, Duration::from_secs(300));
        assert_eq!(config.delivery.transit_delay, Duration::from_secs(4));
        assert_eq!(config.activity.heartbeat_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: OrderConfig =
            serde_json::from_str(r#"{ "accept_delay": { "secs": 1, "nanos": 0 } }"#).unwrap();
        assert_eq!(config.accept_delay, Duration::from_secs(1));
        assert_eq!(config.delivery, DeliveryConfig::default());
    }
}
