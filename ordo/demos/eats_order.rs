//! Eats Order Demo
//!
//! This example demonstrates:
//! - Starting `HandleEatsOrder` instances through the client
//! - The restaurant's decision arriving as the `order-decision` signal
//! - The durable accept delay and the `DeliverOrder` child flow
//! - Structured tracing spans for the worker loop, flows and timer passes
//!
//! ## Scenario
//! Order 42 (pizza) is accepted with reason "ok", waits 3 seconds, is
//! delivered by the child flow after another 4 seconds and the customer is
//! notified. Order 43 is rejected because the restaurant is closed and
//! completes without a delivery.
//!
//! ## Run with
//! ```bash
//! cargo run --example eats_order
//!
//! # With a worker config file
//! cargo run --example eats_order -- worker.json
//! ```

use ordo::executor::{Client, FlowStatus, Worker, WorkerConfig};
use ordo::flows::{self, HandleEatsOrder, Order, OrderDecision, OrderOutcome};
use ordo::storage::InMemoryExecutionLog;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    let worker_id = config.worker_id(1);

    let storage = Arc::new(InMemoryExecutionLog::new());
    let worker = Worker::with_config(storage.clone(), worker_id, config).with_structured_tracing();
    flows::register(&worker).await?;
    let handle = worker.start().await?;

    let client = Client::new(storage.clone());

    let accepted = client
        .start(&HandleEatsOrder::new("user-1", Order::new("42", ["pizza"]), "restaurant-7"))
        .await?;
    let rejected = client
        .start(&HandleEatsOrder::new(
            "user-2",
            Order::new("43", ["sushi", "miso soup"]),
            "restaurant-7",
        ))
        .await?;

    // The restaurant takes a moment to decide
    tokio::time::sleep(Duration::from_millis(500)).await;
    client
        .signal::<HandleEatsOrder, _>("42", &OrderDecision::accept_with("ok"))
        .await?;
    client
        .signal::<HandleEatsOrder, _>("43", &OrderDecision::reject("restaurant closed"))
        .await?;

    for flow_id in [accepted, rejected] {
        let status = client
            .wait_for_completion(flow_id, Duration::from_secs(30))
            .await?;
        let outcome: Option<OrderOutcome> = client.result(flow_id).await?;
        match (status, outcome) {
            (FlowStatus::Completed, Some(outcome)) => {
                info!("Flow {} finished: {:?}", flow_id, outcome)
            }
            (status, _) => info!("Flow {} ended with {:?}", flow_id, status),
        }
    }

    for step in client.history(accepted).await? {
        info!(
            "  step {} {} '{}' {:?}",
            step.step(),
            step.kind(),
            step.name(),
            step.status()
        );
    }

    handle.shutdown().await;
    Ok(())
}
