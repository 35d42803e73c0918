//! Pipelined batch dispatch: dependencies, partitioning, retry, cancellation

mod common;

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use platen::engine::RenderOptions;
use platen::gateway::session::CancelOnDrop;
use platen::gateway::validation::{BatchLimits, prepare_batch};
use platen::gateway::{RenderCall, build_dispatch, collect_batch};

use common::test_router;

fn limits() -> BatchLimits {
    BatchLimits {
        max_document_bytes: 64 * 1024,
        max_batch_calls: 16,
    }
}

fn call(id: &str, document: &str) -> RenderCall {
    RenderCall {
        id: Some(id.to_string()),
        document: document.to_string(),
        options: RenderOptions::default(),
        depends_on: Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn dependent_call_receives_upstream_output() {
    let config = common::test_config(2);
    let (router, _registry, state) = test_router(&config);

    let calls = vec![
        call("cover", "<p>cover</p>"),
        call("report", r#"<embed src="{{call:cover}}">"#),
    ];
    let prepared = prepare_batch(calls, &limits()).expect("prepared");
    let (_guard, cancel) = CancelOnDrop::new();
    let handles = build_dispatch(&router, "tenant-a", prepared, &cancel);
    let response = collect_batch(handles).await;

    assert_eq!(response.results.len(), 2);
    assert!(response.errors.is_empty());

    let report = response
        .results
        .iter()
        .find(|r| r.call_id == "report")
        .expect("report result");
    let rendered = BASE64.decode(&report.data).expect("base64 output");
    let rendered = String::from_utf8(rendered).expect("utf8 mock output");
    // The mock echoes its input, so the spliced data URI must be visible
    assert!(rendered.contains("data:application/pdf;base64,"));
    assert!(!rendered.contains("{{call:"));
    assert_eq!(state.renders(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_dependency_suppresses_dependent_dispatch() {
    let config = common::test_config(2);
    let (router, _registry, state) = test_router(&config);
    // Crash the first attempt and its single retry
    state.crash_renders(2);

    let calls = vec![
        call("cover", "<p>cover</p>"),
        call("report", r#"<embed src="{{call:cover}}">"#),
    ];
    let prepared = prepare_batch(calls, &limits()).expect("prepared");
    let (_guard, cancel) = CancelOnDrop::new();
    let handles = build_dispatch(&router, "tenant-a", prepared, &cancel);
    let response = collect_batch(handles).await;

    assert!(response.results.is_empty());
    assert_eq!(response.errors.len(), 2);
    let cover = response.errors.iter().find(|e| e.call_id == "cover").expect("cover error");
    assert_eq!(cover.error.kind, "instance_crash");
    let report = response.errors.iter().find(|e| e.call_id == "report").expect("report error");
    assert_eq!(report.error.kind, "dependency_failed");
    // The dependent call never rendered anything
    assert_eq!(state.renders(), 0);
}

#[tokio::test(start_paused = true)]
async fn crashed_render_is_retried_once_on_a_fresh_instance() {
    let config = common::test_config(2);
    let (router, _registry, state) = test_router(&config);
    state.crash_renders(1);

    let calls = vec![call("only", "<p>retry me</p>")];
    let prepared = prepare_batch(calls, &limits()).expect("prepared");
    let (_guard, cancel) = CancelOnDrop::new();
    let handles = build_dispatch(&router, "tenant-a", prepared, &cancel);
    let response = collect_batch(handles).await;

    assert_eq!(response.results.len(), 1);
    assert!(response.errors.is_empty());
    // First instance crashed and was evicted; the retry launched a fresh one
    assert_eq!(state.launched(), 2);
    assert_eq!(state.renders(), 1);
}

#[tokio::test(start_paused = true)]
async fn validation_failure_partitions_without_aborting_siblings() {
    let config = common::test_config(2);
    let (router, _registry, _state) = test_router(&config);

    let calls = vec![
        call("a", "<p>first</p>"),
        call("b", "   "),
        call("c", "<p>third</p>"),
    ];
    let prepared = prepare_batch(calls, &limits()).expect("prepared");
    let (_guard, cancel) = CancelOnDrop::new();
    let handles = build_dispatch(&router, "tenant-a", prepared, &cancel);
    let response = collect_batch(handles).await;

    assert_eq!(response.results.len(), 2);
    assert_eq!(response.errors.len(), 1);
    let failure = &response.errors[0];
    assert_eq!(failure.call_id, "b");
    assert_eq!(failure.index, 1);
    assert_eq!(failure.error.kind, "validation");
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_only_unacquired_calls() {
    let config = common::test_config(1);
    let (router, _registry, state) = test_router(&config);
    state.set_render_delay(Duration::from_millis(100));

    let calls = vec![
        call("running", "<p>1</p>"),
        call("queued-1", "<p>2</p>"),
        call("queued-2", "<p>3</p>"),
    ];
    let prepared = prepare_batch(calls, &limits()).expect("prepared");
    let (guard, cancel) = CancelOnDrop::new();
    let handles = build_dispatch(&router, "tenant-a", prepared, &cancel);
    let collector = tokio::spawn(collect_batch(handles));

    // Let the first call acquire the only instance, then drop the session
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(guard);

    let response = collector.await.expect("collector");
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].call_id, "running");
    assert_eq!(response.errors.len(), 2);
    for failure in &response.errors {
        assert_eq!(failure.error.kind, "connection_lost");
    }
    // The in-flight render completed and released; nothing else ever
    // occupied a pool slot.
    assert_eq!(state.renders(), 1);
    assert_eq!(state.launched(), 1);
}

#[tokio::test(start_paused = true)]
async fn independent_calls_do_not_serialize_on_each_other() {
    let config = common::test_config(2);
    let (router, _registry, state) = test_router(&config);
    state.set_render_delay(Duration::from_millis(100));

    let calls = vec![call("x", "<p>x</p>"), call("y", "<p>y</p>")];
    let prepared = prepare_batch(calls, &limits()).expect("prepared");
    let (_guard, cancel) = CancelOnDrop::new();
    let handles = build_dispatch(&router, "tenant-a", prepared, &cancel);

    let started = tokio::time::Instant::now();
    let response = collect_batch(handles).await;
    assert_eq!(response.results.len(), 2);
    // Two 100ms renders on two instances overlap instead of summing
    assert!(started.elapsed() < Duration::from_millis(190));
}
