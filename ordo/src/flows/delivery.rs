//! The delivery flow, run as a child of [`HandleEatsOrder`](super::HandleEatsOrder).
//!
//! `Started -> Delaying -> Delivered`: the order spends `transit_delay` on
//! the road, then the `deliver` activity hands it over. The flow's output is
//! the delivery confirmation.

use super::activities::Deliver;
use super::config::DeliveryConfig;
use crate::core::FlowType;
use crate::executor::{execute_activity, is_replaying, sleep_named, ExecutionError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStage {
    Started,
    Delaying,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FlowType)]
#[flow_type(activities(Deliver))]
#[invokable(output = String)]
pub struct DeliverOrder {
    #[business_key]
    pub order_id: String,
    #[serde(default)]
    pub config: DeliveryConfig,
}

impl DeliverOrder {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            config: DeliveryConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(self: Arc<Self>) -> Result<String, ExecutionError> {
        self.enter(DeliveryStage::Started);
        if !is_replaying() {
            info!(order.id = %self.order_id, "DeliverOrder workflow started");
        }

        self.enter(DeliveryStage::Delaying);
        let delay = self.config.transit_delay;
        sleep_named(delay, "transit").await?;
        if !is_replaying() {
            info!(
                order.id = %self.order_id,
                seconds = delay.as_secs_f64(),
                "Waited {} seconds",
                delay.as_secs_f64()
            );
        }

        let confirmation = execute_activity::<Deliver>(self.order_id.clone(), &self.config.activity)
            .await
            .inspect_err(|e| {
                error!(order.id = %self.order_id, error = %e, "Delivery activity failed.")
            })?;

        self.enter(DeliveryStage::Delivered);
        if !is_replaying() {
            info!(order.id = %self.order_id, result = %confirmation, "Delivery completed");
        }
        Ok(confirmation)
    }

    fn enter(&self, stage: DeliveryStage) {
        if !is_replaying() {
            tracing::debug!(order.id = %self.order_id, stage = ?stage, "Delivery stage");
        }
    }
}
