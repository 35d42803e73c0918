//! Capacity and wait-queue properties of a single shard

mod common;

use std::sync::Arc;
use std::time::Duration;

use platen::config::ServiceConfig;
use platen::engine::RenderOptions;
use platen::error::RenderError;

use common::{spawn_test_shard, test_config};

#[tokio::test(start_paused = true)]
async fn five_concurrent_calls_on_two_instances_all_succeed() {
    let config = test_config(2);
    let (handle, state) = spawn_test_shard(&config);
    state.set_render_delay(Duration::from_millis(100));

    let mut joins = Vec::new();
    for i in 0..5 {
        let handle = handle.clone();
        joins.push(tokio::spawn(async move {
            let mut lease = handle.acquire(format!("call-{i}"), None).await?;
            let output = lease
                .render(&format!("<p>{i}</p>"), &RenderOptions::default())
                .await
                .map_err(|e| RenderError::RenderFailed(e.to_string()))?;
            Ok::<_, RenderError>(output)
        }));
        // Deterministic arrival order
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    for join in joins {
        let result = join.await.expect("task completed");
        assert!(result.is_ok(), "call failed: {result:?}");
    }

    assert_eq!(state.renders(), 5);
    assert_eq!(state.launched(), 2, "exactly two instances started");
    assert_eq!(state.peak_live(), 2, "instance bound never exceeded");
}

#[tokio::test(start_paused = true)]
async fn under_capacity_acquire_starts_exactly_one_instance() {
    let config = test_config(3);
    let (handle, state) = spawn_test_shard(&config);

    let lease = handle.acquire("solo", None).await.expect("acquired");
    assert_eq!(state.launched(), 1);

    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.total_instances, 1);
    assert_eq!(stats.busy_instances, 1);
    drop(lease);
}

#[tokio::test(start_paused = true)]
async fn wait_queue_is_served_in_arrival_order() {
    let config = test_config(1);
    let (handle, _state) = spawn_test_shard(&config);

    let first = handle.acquire("holder", None).await.expect("acquired");

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut joins = Vec::new();
    for i in 0..3 {
        let handle = handle.clone();
        let order = Arc::clone(&order);
        joins.push(tokio::spawn(async move {
            let lease = handle.acquire(format!("queued-{i}"), None).await.expect("acquired");
            order.lock().expect("order lock").push(i);
            drop(lease);
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    drop(first);
    for join in joins {
        join.await.expect("task completed");
    }

    assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn deadline_expiry_yields_capacity_error_and_leaves_no_waiter() {
    let config = test_config(1);
    let (handle, state) = spawn_test_shard(&config);
    state.set_render_delay(Duration::from_millis(500));

    let slow = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut lease = handle.acquire("slow", None).await.expect("acquired");
            lease
                .render("<p>slow</p>", &RenderOptions::default())
                .await
                .expect("render")
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = tokio::time::Instant::now();
    let denied = handle
        .acquire("impatient", Some(Duration::from_millis(100)))
        .await;
    match denied {
        Err(RenderError::CapacityExceeded { retry_after }) => {
            assert_eq!(retry_after, Duration::from_millis(1_000));
        }
        other => panic!("expected capacity error, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_millis(500));

    slow.await.expect("slow task");
    // The abandoned waiter was purged: the released instance sits idle
    // rather than being handed to anyone, and a fresh acquire succeeds.
    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.queued_waiters, 0);
    assert_eq!(stats.idle_instances, 1);

    let lease = handle.acquire("after", None).await.expect("acquired");
    assert_eq!(state.launched(), 1, "idle instance was reused");
    drop(lease);
}

#[tokio::test(start_paused = true)]
async fn full_wait_queue_rejects_immediately() {
    let config = ServiceConfig::builder()
        .shards(1)
        .max_instances(1)
        .wait_queue_limit(1)
        .build()
        .expect("config");
    let (handle, _state) = spawn_test_shard(&config);

    let holder = handle.acquire("holder", None).await.expect("acquired");

    let queued = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.acquire("queued", None).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let started = tokio::time::Instant::now();
    let overflow = handle.acquire("overflow", None).await;
    assert!(
        matches!(overflow, Err(RenderError::CapacityExceeded { .. })),
        "expected overflow rejection, got {overflow:?}"
    );
    assert!(
        started.elapsed() < Duration::from_millis(50),
        "overflow rejection must not wait for the deadline"
    );

    drop(holder);
    assert!(queued.await.expect("queued task").is_ok());
}

#[tokio::test(start_paused = true)]
async fn launch_failure_is_reported_not_retried() {
    let config = test_config(2);
    let (handle, state) = spawn_test_shard(&config);
    state.fail_launches(1);

    let denied = handle.acquire("doomed", None).await;
    assert!(
        matches!(denied, Err(RenderError::CreationFailure(_))),
        "expected creation failure, got {denied:?}"
    );
    assert_eq!(state.launched(), 0);

    // Shard state is intact: the next acquire launches and succeeds.
    let lease = handle.acquire("healthy", None).await.expect("acquired");
    assert_eq!(state.launched(), 1);
    drop(lease);
}
