//! The order handling flow.
//!
//! ```text
//! Received -> AwaitingDecision -> Rejected
//!                              -> Accepted -> Delaying -> Delivering -> Notifying -> Completed
//! ```
//!
//! The flow acknowledges the order, then waits for the restaurant's
//! decision for as long as it takes. A rejection ends the flow normally. An
//! accepted order is held for `accept_delay`, delivered by a
//! [`DeliverOrder`] child flow within `delivery_timeout`, and the customer
//! is notified.

use super::activities::{NotifyCustomer, ReceiveAck, ReceiveAckInput};
use super::config::OrderConfig;
use super::delivery::DeliverOrder;
use crate::core::FlowType;
use crate::executor::{
    execute_activity, is_replaying, receive_signal, sleep_named, ExecutionError, InvokeChild,
    SignalType,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub content: Vec<String>,
}

impl Order {
    pub fn new<I, C>(id: impl Into<String>, content: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        Self {
            id: id.into(),
            content: content.into_iter().map(Into::into).collect(),
        }
    }
}

/// The restaurant's answer, delivered as the `order-decision` signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDecision {
    pub accepted: bool,
    pub reason: String,
}

impl OrderDecision {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: String::new(),
        }
    }

    pub fn accept_with(reason: impl Into<String>) -> Self {
        Self {
            accepted: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
        }
    }
}

impl SignalType for OrderDecision {
    const NAME: &'static str = "order-decision";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStage {
    Received,
    AwaitingDecision,
    Rejected,
    Accepted,
    Delaying,
    Delivering,
    Notifying,
    Completed,
}

/// How a handled order ended. Both variants are successful completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOutcome {
    Rejected {
        reason: String,
    },
    Delivered {
        confirmation: String,
        customer_message: String,
    },
}

impl OrderOutcome {
    pub fn stage(&self) -> OrderStage {
        match self {
            OrderOutcome::Rejected { .. } => OrderStage::Rejected,
            OrderOutcome::Delivered { .. } => OrderStage::Completed,
        }
    }
}

/// Handles one order from receipt to the customer's door.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FlowType)]
#[flow_type(activities(ReceiveAck, NotifyCustomer))]
pub struct HandleEatsOrder {
    pub user_id: String,
    #[business_key(id)]
    pub order: Order,
    pub restaurant_id: String,
    #[serde(default)]
    pub config: OrderConfig,
}

impl HandleEatsOrder {
    pub fn new(user_id: impl Into<String>, order: Order, restaurant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            order,
            restaurant_id: restaurant_id.into(),
            config: OrderConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrderConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(self: Arc<Self>) -> Result<OrderOutcome, ExecutionError> {
        if !is_replaying() {
            info!(order.id = %self.order.id, "HandleEatsOrder workflow started");
        }

        self.enter(OrderStage::Received);
        let receipt = execute_activity::<ReceiveAck>(
            ReceiveAckInput {
                user_id: self.user_id.clone(),
                order: self.order.clone(),
                restaurant_id: self.restaurant_id.clone(),
            },
            &self.config.activity,
        )
        .await
        .inspect_err(|e| self.log_failure("Activity failed", e))?;

        self.enter(OrderStage::AwaitingDecision);
        let decision: OrderDecision = receive_signal().await?;

        if !decision.accepted {
            if !is_replaying() {
                info!(order.id = %self.order.id, reason = %decision.reason, "Order rejected");
            }
            self.enter(OrderStage::Rejected);
            return Ok(OrderOutcome::Rejected {
                reason: decision.reason,
            });
        }

        if !is_replaying() {
            info!(order.id = %self.order.id, reason = %decision.reason, "Order accepted");
        }
        self.enter(OrderStage::Accepted);

        self.enter(OrderStage::Delaying);
        let delay = self.config.accept_delay;
        sleep_named(delay, "accept-delay").await?;
        if !is_replaying() {
            info!(
                order.id = %self.order.id,
                seconds = delay.as_secs_f64(),
                "Waited {} seconds",
                delay.as_secs_f64()
            );
        }

        self.enter(OrderStage::Delivering);
        let delivery = DeliverOrder::new(&self.order.id).with_config(self.config.delivery.clone());
        let confirmation = self
            .invoke(delivery)
            .with_timeout(self.config.delivery_timeout)
            .result()
            .await
            .inspect_err(|e| self.log_failure("Delivery workflow failed", e))?;

        self.enter(OrderStage::Notifying);
        let customer_message = execute_activity::<NotifyCustomer>((), &self.config.activity)
            .await
            .inspect_err(|e| self.log_failure("Customer message activity failed", e))?;
        if !is_replaying() {
            info!(order.id = %self.order.id, message = %customer_message, "Customer message");
        }

        self.enter(OrderStage::Completed);
        if !is_replaying() {
            info!(order.id = %self.order.id, result = %receipt, "Workflow completed.");
        }

        Ok(OrderOutcome::Delivered {
            confirmation,
            customer_message,
        })
    }

    fn enter(&self, stage: OrderStage) {
        if !is_replaying() {
            tracing::debug!(order.id = %self.order.id, stage = ?stage, "Order stage");
        }
    }

    fn log_failure(&self, what: &str, e: &ExecutionError) {
        if !matches!(e, ExecutionError::Suspended) {
            error!(order.id = %self.order.id, error = %e, "{}", what);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_json_without_config_uses_defaults() {
        let json = r#"{
            "user_id": "u-1",
            "order": { "id": "o-1", "content": ["pizza", "cola"] },
            "restaurant_id": "r-1"
        }"#;
        let flow: HandleEatsOrder = serde_json::from_str(json).unwrap();
        assert_eq!(flow.business_key(), "o-1");
        assert_eq!(flow.order, Order::new("o-1", ["pizza", "cola"]));
        assert_eq!(flow.config, OrderConfig::default());
    }

    #[test]
    fn test_decision_wire_format() {
        let decision: OrderDecision =
            serde_json::from_str(r#"{ "accepted": false, "reason": "closed" }"#).unwrap();
        assert_eq!(decision, OrderDecision::reject("closed"));
        assert_eq!(OrderDecision::NAME, "order-decision");
    }

    #[test]
    fn test_outcome_stage() {
        let rejected = OrderOutcome::Rejected {
            reason: "closed".into(),
        };
        assert_eq!(rejected.stage(), OrderStage::Rejected);
    }
}
