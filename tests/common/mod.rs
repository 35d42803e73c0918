//! Shared test fixtures: a scripted mock engine behind the launcher trait
//!
//! The mock tracks live-process and launch counts so tests can assert the
//! pool's capacity invariants, and supports injecting render crashes and
//! launch failures at chosen points.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use platen::config::ServiceConfig;
use platen::engine::{EngineError, EngineLauncher, RenderEngine, RenderOptions, RenderOutput};
use platen::pool::{PoolHandle, PoolRegistry, spawn_shard};
use platen::router::Router;

/// Shared observable state of a mock engine fleet
#[derive(Default)]
pub struct MockState {
    /// Total launches attempted successfully
    pub launched: AtomicUsize,
    /// Engine processes currently alive
    pub live: AtomicUsize,
    /// High-water mark of concurrently alive processes
    pub peak_live: AtomicUsize,
    /// Completed renders across all engines
    pub renders: AtomicUsize,
    /// Countdown: the next N launches fail
    pub fail_next_launches: AtomicUsize,
    /// Countdown: the next N renders crash their engine
    pub crash_next_renders: AtomicUsize,
    /// Virtual render duration in milliseconds
    pub render_delay_ms: AtomicU64,
}

impl MockState {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn fail_launches(&self, count: usize) {
        self.fail_next_launches.store(count, Ordering::SeqCst);
    }

    pub fn crash_renders(&self, count: usize) {
        self.crash_next_renders.store(count, Ordering::SeqCst);
    }

    pub fn set_render_delay(&self, delay: Duration) {
        self.render_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn take_countdown(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Launcher producing scripted mock engines
#[derive(Clone)]
pub struct MockLauncher {
    state: Arc<MockState>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl EngineLauncher for MockLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, EngineError> {
        if MockState::take_countdown(&self.state.fail_next_launches) {
            return Err(EngineError::Launch("injected launch failure".to_string()));
        }
        self.state.launched.fetch_add(1, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            state: Arc::clone(&self.state),
            alive: AtomicBool::new(true),
            counted: AtomicBool::new(true),
        }))
    }
}

pub struct MockEngine {
    state: Arc<MockState>,
    alive: AtomicBool,
    counted: AtomicBool,
}

impl MockEngine {
    /// Decrement the live count exactly once per engine lifetime
    fn mark_dead(&self) {
        if self.counted.swap(false, Ordering::SeqCst) {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RenderEngine for MockEngine {
    async fn render(
        &self,
        document: &str,
        _options: &RenderOptions,
    ) -> Result<RenderOutput, EngineError> {
        let delay = self.state.render_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if MockState::take_countdown(&self.state.crash_next_renders) {
            self.alive.store(false, Ordering::SeqCst);
            self.mark_dead();
            return Err(EngineError::Crashed("injected crash".to_string()));
        }
        self.state.renders.fetch_add(1, Ordering::SeqCst);
        Ok(RenderOutput {
            data: format!("pdf:{document}").into_bytes(),
            timing_ms: delay,
        })
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.mark_dead();
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.mark_dead();
    }
}

/// Service config tuned for fast tests
pub fn test_config(max_instances: usize) -> ServiceConfig {
    ServiceConfig::builder()
        .shards(1)
        .max_instances(max_instances)
        .acquire_deadline_ms(5_000)
        .wait_queue_limit(16)
        .max_renders_per_instance(1_000)
        .build()
        .expect("test config")
}

/// One shard backed by a fresh mock fleet
pub fn spawn_test_shard(config: &ServiceConfig) -> (PoolHandle, Arc<MockState>) {
    let launcher = MockLauncher::new();
    let state = launcher.state();
    let handle = spawn_shard(0, config.pool().clone(), Arc::new(launcher));
    (handle, state)
}

/// Registry + router backed by a fresh mock fleet
pub fn test_router(config: &ServiceConfig) -> (Arc<Router>, Arc<PoolRegistry>, Arc<MockState>) {
    let launcher = MockLauncher::new();
    let state = launcher.state();
    let launcher: Arc<dyn EngineLauncher> = Arc::new(launcher);
    let registry = PoolRegistry::start(config, Arc::clone(&launcher));
    let router = Router::new(Arc::clone(&registry), launcher);
    (router, registry, state)
}
