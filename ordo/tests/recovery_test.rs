//! Crash, restart and replay behavior.

mod common;

use async_trait::async_trait;
use common::{
    fast_config, fast_worker, order, start_worker, wait_for_status, CountingDeliver,
    CountingNotify, CountingReceiveAck, Counters, WAIT,
};
use ordo::core::{FlowType, StepKind};
use ordo::executor::{
    execute_activity, receive_signal, sleep, Activity, ActivityContext, ActivityError,
    ActivityExecutor, ActivityOptions, ActivityRegistry, Client, ExecutionError, FlowInstance,
    FlowOutcome, FlowStatus, SignalType,
};
use ordo::flows::{
    self, DeliverOrder, DeliveryConfig, HandleEatsOrder, OrderDecision, OrderOutcome, ReceiveAck,
    ReceiveAckInput,
};
use ordo::storage::{ExecutionLog, InMemoryExecutionLog, TaskStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_new_worker_resumes_waiting_order() {
    let storage = Arc::new(InMemoryExecutionLog::new());
    let client = Client::new(storage.clone());

    let (first, before) = start_worker(storage.clone(), "eats-worker-1", false).await;
    let flow_id = client.start(&order("50")).await.unwrap();
    wait_for_status(&client, flow_id, FlowStatus::Suspended)
        .await
        .unwrap();
    first.shutdown().await;
    assert_eq!(before.receive_ack(), 1);

    let (second, after) = start_worker(storage.clone(), "eats-worker-2", false).await;
    client
        .signal::<HandleEatsOrder, _>("50", &OrderDecision::accept())
        .await
        .unwrap();
    assert_eq!(
        client.wait_for_completion(flow_id, WAIT).await.unwrap(),
        FlowStatus::Completed
    );

    // Replayed from history, not run again
    assert_eq!(after.receive_ack(), 0);
    assert_eq!(after.deliver(), 1);
    assert_eq!(after.notify(), 1);

    second.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_no_flow_locked() {
    for round in 0..20 {
        let storage = Arc::new(InMemoryExecutionLog::new());
        let client = Client::new(storage.clone());
        let key = format!("idle-{}", round);

        let (handle, _) = start_worker(storage.clone(), "eats-worker-1", false).await;
        let flow_id = client.start(&order(&key)).await.unwrap();
        wait_for_status(&client, flow_id, FlowStatus::Suspended)
            .await
            .unwrap();
        handle.shutdown().await;

        // No worker alive: the decision must wait in the queue, unlocked
        client
            .signal::<HandleEatsOrder, _>(&key, &OrderDecision::accept())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = storage.get_flow(flow_id).await.unwrap().unwrap();
        assert_eq!(queued.status, TaskStatus::Pending, "round {}", round);
        assert!(queued.locked_by.is_none(), "round {}", round);
    }
}

/// `receive-ack` that takes a while, so a worker can die in the middle of it.
struct SlowReceiveAck(Counters);

#[async_trait]
impl Activity for SlowReceiveAck {
    const NAME: &'static str = "receive-ack";
    type Input = ReceiveAckInput;
    type Output = String;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: ReceiveAckInput,
    ) -> Result<String, ActivityError> {
        self.0.receive_ack.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        ReceiveAck.execute(ctx, input).await
    }
}

#[tokio::test]
async fn test_crashed_worker_flows_resume_on_restart() {
    let storage = Arc::new(InMemoryExecutionLog::new());
    let client = Client::new(storage.clone());

    let crashing = fast_worker(storage.clone(), "eats-worker-1");
    let before = Counters::default();
    crashing
        .register_activity(SlowReceiveAck(before.clone()))
        .await
        .unwrap();
    crashing
        .register_activity(CountingDeliver {
            counters: before.clone(),
            fail: false,
        })
        .await
        .unwrap();
    crashing
        .register_activity(CountingNotify(before.clone()))
        .await
        .unwrap();
    flows::register_flows(&crashing).await.unwrap();
    let crashed = crashing.start().await.unwrap();

    let flow_id = client.start(&order("51")).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while before.receive_ack() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    crashed.abort();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Nobody released it: still locked by the dead worker
    assert_eq!(client.status(flow_id).await.unwrap(), FlowStatus::Running);

    // Same id: the restarted process takes its flows back
    let (restarted, after) = start_worker(storage.clone(), "eats-worker-1", false).await;
    wait_for_status(&client, flow_id, FlowStatus::Suspended)
        .await
        .unwrap();
    client
        .signal::<HandleEatsOrder, _>("51", &OrderDecision::accept())
        .await
        .unwrap();
    assert_eq!(
        client.wait_for_completion(flow_id, WAIT).await.unwrap(),
        FlowStatus::Completed
    );

    assert_eq!(before.receive_ack(), 1);
    assert_eq!(after.receive_ack(), 0);
    assert_eq!(after.deliver(), 1);

    restarted.shutdown().await;
}

#[tokio::test]
async fn test_delivery_over_budget_fails_the_order() {
    let storage = Arc::new(InMemoryExecutionLog::new());
    let (handle, counters) = start_worker(storage.clone(), "eats-worker-1", false).await;
    let client = Client::new(storage.clone());

    let slow_road = fast_config()
        .with_delivery_timeout(Duration::from_millis(50))
        .with_delivery(DeliveryConfig::default().with_transit_delay(Duration::from_secs(3)));
    let flow_id = client.start(&order("52").with_config(slow_road)).await.unwrap();
    client
        .signal::<HandleEatsOrder, _>("52", &OrderDecision::accept())
        .await
        .unwrap();

    match client.wait_for_completion(flow_id, WAIT).await.unwrap() {
        FlowStatus::Failed { error } => {
            assert!(error.contains("deadline exceeded"), "unexpected error: {}", error)
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(
        client.status_by_key::<DeliverOrder>("52").await.unwrap(),
        FlowStatus::Failed {
            error: "deadline exceeded".to_string()
        }
    );
    assert_eq!(counters.deliver(), 0);
    assert_eq!(counters.notify(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_two_workers_share_the_queue() {
    let storage = Arc::new(InMemoryExecutionLog::new());
    let (a, on_a) = start_worker(storage.clone(), "eats-worker-1", false).await;
    let (b, on_b) = start_worker(storage.clone(), "eats-worker-2", false).await;
    let client = Client::new(storage.clone());

    let mut ids = Vec::new();
    for i in 0..6 {
        let key = format!("shared-{}", i);
        ids.push(client.start(&order(&key)).await.unwrap());
        client
            .signal::<HandleEatsOrder, _>(&key, &OrderDecision::accept())
            .await
            .unwrap();
    }
    for id in ids {
        assert_eq!(
            client.wait_for_completion(id, WAIT).await.unwrap(),
            FlowStatus::Completed
        );
    }

    // Every order delivered exactly once across both workers
    let mut delivered = on_a.delivered();
    delivered.extend(on_b.delivered());
    delivered.sort();
    let expected: Vec<String> = (0..6).map(|i| format!("shared-{}", i)).collect();
    assert_eq!(delivered, expected);
    assert_eq!(on_a.receive_ack() + on_b.receive_ack(), 6);

    a.shutdown().await;
    b.shutdown().await;
}

async fn steps_of(
    client: &Client<InMemoryExecutionLog>,
    flow_id: Uuid,
) -> Vec<(i32, StepKind, String)> {
    client
        .history(flow_id)
        .await
        .unwrap()
        .iter()
        .map(|inv| (inv.step(), inv.kind(), inv.name().to_string()))
        .collect()
}

#[tokio::test]
async fn test_finished_order_replays_from_history() {
    let storage = Arc::new(InMemoryExecutionLog::new());
    let (handle, counters) = start_worker(storage.clone(), "eats-worker-1", false).await;
    let client = Client::new(storage.clone());

    let flow = order("53");
    let flow_id = client.start(&flow).await.unwrap();
    client
        .signal::<HandleEatsOrder, _>("53", &OrderDecision::accept())
        .await
        .unwrap();
    assert_eq!(
        client.wait_for_completion(flow_id, WAIT).await.unwrap(),
        FlowStatus::Completed
    );
    handle.shutdown().await;

    let recorded: OrderOutcome = client.result(flow_id).await.unwrap().unwrap();
    let before = steps_of(&client, flow_id).await;
    assert_eq!(before.len(), 6);

    // Run the whole flow again from the top against its history
    let again = Counters::default();
    let mut registry = ActivityRegistry::new();
    registry
        .register(CountingReceiveAck(again.clone()))
        .unwrap();
    registry
        .register(CountingDeliver {
            counters: again.clone(),
            fail: false,
        })
        .unwrap();
    registry.register(CountingNotify(again.clone())).unwrap();
    let activities = Arc::new(ActivityExecutor::new(registry, 4));
    let instance = FlowInstance::new(flow_id, flow, storage.clone(), activities);

    match instance.execute(|f| f.run()).await {
        FlowOutcome::Completed(Ok(outcome)) => assert_eq!(outcome, recorded),
        other => panic!("expected a replayed completion, got {:?}", other),
    }
    assert_eq!(steps_of(&client, flow_id).await, before);
    assert_eq!(again.receive_ack() + again.deliver() + again.notify(), 0);
    assert_eq!(counters.receive_ack(), 1);
}

// ============================================================================
// Determinism
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FlowType)]
struct Evolving {
    #[business_key]
    key: String,
}

#[derive(Serialize, Deserialize)]
struct Go;

impl SignalType for Go {
    const NAME: &'static str = "go";
}

struct Stamp;

#[async_trait]
impl Activity for Stamp {
    const NAME: &'static str = "stamp";
    type Input = String;
    type Output = String;

    async fn execute(&self, _ctx: &ActivityContext, key: String) -> Result<String, ActivityError> {
        Ok(format!("stamped {}", key))
    }
}

impl Evolving {
    async fn first_release(self: Arc<Self>) -> Result<String, ExecutionError> {
        let stamp = execute_activity::<Stamp>(self.key.clone(), &ActivityOptions::default()).await?;
        let _: Go = receive_signal().await?;
        Ok(stamp)
    }

    /// Deployed while instances of `first_release` were still waiting.
    async fn second_release(self: Arc<Self>) -> Result<String, ExecutionError> {
        sleep(Duration::from_millis(1)).await?;
        let stamp = execute_activity::<Stamp>(self.key.clone(), &ActivityOptions::default()).await?;
        let _: Go = receive_signal().await?;
        Ok(stamp)
    }
}

#[tokio::test]
async fn test_changed_flow_code_fails_instead_of_diverging() {
    let storage = Arc::new(InMemoryExecutionLog::new());
    let client = Client::new(storage.clone());

    let old = fast_worker(storage.clone(), "eats-worker-1");
    old.register_activity(Stamp).await.unwrap();
    old.register(|flow: Arc<Evolving>| flow.first_release())
        .await
        .unwrap();
    let old = old.start().await.unwrap();

    let flow_id = client
        .start(&Evolving {
            key: "e-1".to_string(),
        })
        .await
        .unwrap();
    wait_for_status(&client, flow_id, FlowStatus::Suspended)
        .await
        .unwrap();
    old.shutdown().await;

    let new = fast_worker(storage.clone(), "eats-worker-1");
    new.register_activity(Stamp).await.unwrap();
    new.register(|flow: Arc<Evolving>| flow.second_release())
        .await
        .unwrap();
    let new = new.start().await.unwrap();

    client.signal::<Evolving, _>("e-1", &Go).await.unwrap();
    match client.wait_for_completion(flow_id, WAIT).await.unwrap() {
        FlowStatus::Failed { error } => {
            assert!(error.contains("incompatible"), "unexpected error: {}", error)
        }
        other => panic!("expected failure, got {:?}", other),
    }

    new.shutdown().await;
}
