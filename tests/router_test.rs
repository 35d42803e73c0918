//! Routing: stable shard mapping and the unpooled fallback path

mod common;

use platen::engine::RenderOptions;

use common::test_router;
use platen::config::ServiceConfig;

#[tokio::test(start_paused = true)]
async fn tenant_identity_maps_to_a_stable_shard() {
    let config = ServiceConfig::builder()
        .shards(4)
        .build()
        .expect("config");
    let (router, _registry, _state) = test_router(&config);

    let first = router.shard_for("tenant-a");
    for _ in 0..10 {
        assert_eq!(router.shard_for("tenant-a"), first);
    }
    assert!(first < 4);
}

#[tokio::test(start_paused = true)]
async fn pooled_render_reuses_the_warm_instance() {
    let config = common::test_config(2);
    let (router, _registry, state) = test_router(&config);

    for i in 0..3 {
        let output = router
            .render(
                "tenant-a",
                &format!("call-{i}"),
                "<p>doc</p>",
                &RenderOptions::default(),
            )
            .await
            .expect("render");
        assert_eq!(output.data, b"pdf:<p>doc</p>".to_vec());
    }

    assert_eq!(state.launched(), 1, "sequential calls share one instance");
    assert_eq!(router.fallback_renders(), 0);
}

#[tokio::test(start_paused = true)]
async fn draining_shard_degrades_to_unpooled_render() {
    let config = common::test_config(2);
    let (router, registry, state) = test_router(&config);

    registry.shutdown().await;

    let output = router
        .render("tenant-a", "call-0", "<p>doc</p>", &RenderOptions::default())
        .await
        .expect("fallback render");
    assert_eq!(output.data, b"pdf:<p>doc</p>".to_vec());
    assert_eq!(router.fallback_renders(), 1);

    // The one-off engine was closed right after the render
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(state.live(), 0);
}
