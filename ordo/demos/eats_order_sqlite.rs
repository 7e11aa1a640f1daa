//! Eats Order Crash Recovery Demo (SQLite)
//!
//! This example demonstrates:
//! - Orders waiting for a decision survive a worker shutdown
//! - A second worker process picks them up from the same database file
//! - Completed steps are replayed from history, not run again
//!
//! ## Scenario
//! A first worker acknowledges order 77 and parks it on the decision
//! signal, then stops. A second worker opens the same database, the
//! restaurant accepts the order, and the second worker finishes it: accept
//! delay, delivery child flow and customer notification.
//!
//! ## Run with
//! ```bash
//! cargo run --example eats_order_sqlite --features=sqlite
//! ```

use ordo::executor::{Client, FlowStatus, Worker, WorkerConfig};
use ordo::flows::{
    self, DeliveryConfig, HandleEatsOrder, Order, OrderConfig, OrderDecision, OrderOutcome,
};
use ordo::storage::{ExecutionLog, SqliteExecutionLog};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DB_PATH: &str = "/tmp/ordo_eats_order.db";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::default();
    let delivery = DeliveryConfig::default().with_transit_delay(Duration::from_secs(2));
    let burger = Order::new("77", ["burger", "fries"]);
    let order = HandleEatsOrder::new("user-1", burger, "restaurant-3")
        .with_config(
            OrderConfig::default()
                .with_accept_delay(Duration::from_secs(1))
                .with_delivery(delivery),
        );

    // First process: acknowledge and wait for the decision
    let flow_id = {
        let storage = Arc::new(SqliteExecutionLog::new(DB_PATH).await?);
        storage.reset().await?;

        let worker = Worker::with_config(storage.clone(), config.worker_id(1), config.clone());
        flows::register(&worker).await?;
        let handle = worker.start().await?;

        let client = Client::new(storage.clone());
        let flow_id = client.start(&order).await?;
        while client.status(flow_id).await? != FlowStatus::Suspended {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Order 77 is waiting for the restaurant; stopping the first worker");

        handle.shutdown().await;
        storage.close().await?;
        flow_id
    };

    // Second process: same database, different worker
    let storage = Arc::new(SqliteExecutionLog::new(DB_PATH).await?);
    let worker = Worker::with_config(storage.clone(), config.worker_id(2), config.clone())
        .with_structured_tracing();
    flows::register(&worker).await?;
    let handle = worker.start().await?;

    let client = Client::new(storage.clone());
    client
        .signal::<HandleEatsOrder, _>("77", &OrderDecision::accept_with("ok"))
        .await?;

    let status = client
        .wait_for_completion(flow_id, Duration::from_secs(30))
        .await?;
    let outcome: Option<OrderOutcome> = client.result(flow_id).await?;
    info!("Order 77 ended with {:?}: {:?}", status, outcome);

    handle.shutdown().await;
    storage.close().await?;
    Ok(())
}
