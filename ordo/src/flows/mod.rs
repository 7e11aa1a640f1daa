//! Order fulfillment flows.
//!
//! [`HandleEatsOrder`] takes an order from receipt through the restaurant's
//! decision to delivery, delegating the delivery itself to the
//! [`DeliverOrder`] child flow.
//!
//! ```no_run
//! use ordo::executor::{Client, Worker};
//! use ordo::flows::{self, HandleEatsOrder, Order, OrderDecision};
//! use ordo::storage::InMemoryExecutionLog;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(InMemoryExecutionLog::new());
//! let worker = Worker::new(storage.clone(), "eats-worker-1");
//! flows::register(&worker).await?;
//! let handle = worker.start().await?;
//!
//! let client = Client::new(storage);
//! client
//!     .start(&HandleEatsOrder::new("u-1", Order::new("o-1", ["pizza"]), "r-1"))
//!     .await?;
//! client
//!     .signal::<HandleEatsOrder, _>("o-1", &OrderDecision::accept())
//!     .await?;
//! # handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod activities;
mod config;
mod delivery;
mod order;

pub use activities::{Deliver, NotifyCustomer, ReceiveAck, ReceiveAckInput};
pub use config::{DeliveryConfig, OrderConfig};
pub use delivery::{DeliverOrder, DeliveryStage};
pub use order::{HandleEatsOrder, Order, OrderDecision, OrderOutcome, OrderStage};

use crate::executor::{RegistrationError, TracingBehavior, Worker};
use crate::storage::ExecutionLog;
use std::sync::Arc;

/// Registers the activities of both flows.
pub async fn register_activities<S, Tr>(worker: &Worker<S, Tr>) -> Result<(), RegistrationError>
where
    S: ExecutionLog + 'static,
    Tr: TracingBehavior + Clone + 'static,
{
    worker.register_activity(ReceiveAck).await?;
    worker.register_activity(Deliver).await?;
    worker.register_activity(NotifyCustomer).await?;
    Ok(())
}

/// Registers both flows. Their activities must be registered first.
pub async fn register_flows<S, Tr>(worker: &Worker<S, Tr>) -> Result<(), RegistrationError>
where
    S: ExecutionLog + 'static,
    Tr: TracingBehavior + Clone + 'static,
{
    worker
        .register(|flow: Arc<HandleEatsOrder>| flow.run())
        .await?;
    worker.register(|flow: Arc<DeliverOrder>| flow.run()).await
}

/// Registers everything the order flows need.
pub async fn register<S, Tr>(worker: &Worker<S, Tr>) -> Result<(), RegistrationError>
where
    S: ExecutionLog + 'static,
    Tr: TracingBehavior + Clone + 'static,
{
    register_activities(worker).await?;
    register_flows(worker).await
}
