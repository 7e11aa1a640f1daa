//! Shared fixtures for the integration tests: counting versions of the order
//! activities, short timings and worker setup.

#![allow(dead_code)]

use async_trait::async_trait;
use ordo::executor::{
    Activity, ActivityContext, ActivityError, Client, ClientError, FlowStatus, Worker,
    WorkerHandle,
};
use ordo::flows::{
    self, DeliveryConfig, HandleEatsOrder, NotifyCustomer, Order, OrderConfig, ReceiveAck,
    ReceiveAckInput,
};
use ordo::storage::ExecutionLog;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(10);

/// Call counts of the order activities, shared with the test body.
#[derive(Clone, Default)]
pub struct Counters {
    pub receive_ack: Arc<AtomicU32>,
    pub deliver: Arc<AtomicU32>,
    pub notify: Arc<AtomicU32>,
    pub delivered: Arc<Mutex<Vec<String>>>,
}

impl Counters {
    pub fn receive_ack(&self) -> u32 {
        self.receive_ack.load(Ordering::SeqCst)
    }

    pub fn deliver(&self) -> u32 {
        self.deliver.load(Ordering::SeqCst)
    }

    pub fn notify(&self) -> u32 {
        self.notify.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

pub struct CountingReceiveAck(pub Counters);

#[async_trait]
impl Activity for CountingReceiveAck {
    const NAME: &'static str = ReceiveAck::NAME;
    type Input = ReceiveAckInput;
    type Output = String;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: ReceiveAckInput,
    ) -> Result<String, ActivityError> {
        self.0.receive_ack.fetch_add(1, Ordering::SeqCst);
        ReceiveAck.execute(ctx, input).await
    }
}

/// `deliver` that records the order ids it saw, or always fails.
pub struct CountingDeliver {
    pub counters: Counters,
    pub fail: bool,
}

#[async_trait]
impl Activity for CountingDeliver {
    const NAME: &'static str = "deliver";
    type Input = String;
    type Output = String;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        order_id: String,
    ) -> Result<String, ActivityError> {
        self.counters.deliver.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ActivityError::permanent("courier lost the order"));
        }
        self.counters.delivered.lock().unwrap().push(order_id.clone());
        Ok(format!("Order {} delivered!", order_id))
    }
}

pub struct CountingNotify(pub Counters);

#[async_trait]
impl Activity for CountingNotify {
    const NAME: &'static str = NotifyCustomer::NAME;
    type Input = ();
    type Output = String;

    async fn execute(&self, ctx: &ActivityContext, input: ()) -> Result<String, ActivityError> {
        self.0.notify.fetch_add(1, Ordering::SeqCst);
        NotifyCustomer.execute(ctx, input).await
    }
}

/// Order config with millisecond delays.
pub fn fast_config() -> OrderConfig {
    OrderConfig::default()
        .with_accept_delay(Duration::from_millis(20))
        .with_delivery_timeout(Duration::from_secs(5))
        .with_delivery(DeliveryConfig::default().with_transit_delay(Duration::from_millis(20)))
}

pub fn order(id: &str) -> HandleEatsOrder {
    HandleEatsOrder::new("user-1", Order::new(id, ["pizza"]), "restaurant-1")
        .with_config(fast_config())
}

pub fn fast_worker<S: ExecutionLog + 'static>(storage: Arc<S>, worker_id: &str) -> Worker<S> {
    Worker::new(storage, worker_id)
        .with_poll_interval(Duration::from_millis(10))
        .with_timer_interval(Duration::from_millis(10))
}

/// Registers counting activities and both flows on `worker`.
pub async fn register_counting<S: ExecutionLog + 'static>(
    worker: &Worker<S>,
    deliver_fails: bool,
) -> Counters {
    let counters = Counters::default();
    worker
        .register_activity(CountingReceiveAck(counters.clone()))
        .await
        .unwrap();
    worker
        .register_activity(CountingDeliver {
            counters: counters.clone(),
            fail: deliver_fails,
        })
        .await
        .unwrap();
    worker
        .register_activity(CountingNotify(counters.clone()))
        .await
        .unwrap();
    flows::register_flows(worker).await.unwrap();
    counters
}

/// Starts a fast worker with counting activities.
pub async fn start_worker<S: ExecutionLog + 'static>(
    storage: Arc<S>,
    worker_id: &str,
    deliver_fails: bool,
) -> (WorkerHandle, Counters) {
    let worker = fast_worker(storage, worker_id);
    let counters = register_counting(&worker, deliver_fails).await;
    (worker.start().await.unwrap(), counters)
}

/// Polls until the instance reports `expected`.
pub async fn wait_for_status<S: ExecutionLog>(
    client: &Client<S>,
    flow_id: Uuid,
    expected: FlowStatus,
) -> Result<(), ClientError> {
    tokio::time::timeout(WAIT, async {
        loop {
            if client.status(flow_id).await? == expected {
                return Ok::<(), ClientError>(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| ClientError::Timeout(flow_id))?
}
