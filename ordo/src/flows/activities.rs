//! Activities of the order flows.
//!
//! Each one only formats and logs its message; a real deployment would
//! call the restaurant, courier and notification services here.

use super::order::Order;
use crate::executor::{Activity, ActivityContext, ActivityError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Input of [`ReceiveAck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveAckInput {
    pub user_id: String,
    pub order: Order,
    pub restaurant_id: String,
}

/// Acknowledges receipt of an order.
pub struct ReceiveAck;

#[async_trait]
impl Activity for ReceiveAck {
    const NAME: &'static str = "receive-ack";
    type Input = ReceiveAckInput;
    type Output = String;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: ReceiveAckInput,
    ) -> Result<String, ActivityError> {
        info!(attempt = ctx.attempt(), "receive-ack activity started");
        Ok(format!(
            "Order {} received: [{}] from userId {} for restaurantId {}",
            input.order.id,
            input.order.content.join(", "),
            input.user_id,
            input.restaurant_id
        ))
    }
}

/// Hands an order over to the customer.
pub struct Deliver;

#[async_trait]
impl Activity for Deliver {
    const NAME: &'static str = "deliver";
    type Input = String;
    type Output = String;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        order_id: String,
    ) -> Result<String, ActivityError> {
        info!(order.id = %order_id, "Delivering order");
        Ok(format!("Order {} delivered!", order_id))
    }
}

/// Produces the message shown to the customer once the order arrived.
pub struct NotifyCustomer;

#[async_trait]
impl Activity for NotifyCustomer {
    const NAME: &'static str = "notify-customer";
    type Input = ();
    type Output = String;

    async fn execute(&self, _ctx: &ActivityContext, _input: ()) -> Result<String, ActivityError> {
        info!("Printing customer message");
        Ok("Your order is in front of your door!".to_string())
    }
}
