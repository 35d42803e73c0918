//! Core configuration types for the render service

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-shard pool tuning
///
/// Thresholds mirror the operational envelope of a warm Chromium fleet:
/// a handful of instances per shard, recycled on use count or age so
/// long-lived renderer processes never accumulate unbounded memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum warm engine instances per shard (valid range 1..=5)
    pub(crate) max_instances: usize,
    /// Instances launched eagerly at startup (0 = create on first acquire)
    pub(crate) warm_instances: usize,
    /// Default acquisition deadline in milliseconds
    pub(crate) acquire_deadline_ms: u64,
    /// Maximum queued acquisitions per shard before immediate rejection
    pub(crate) wait_queue_limit: usize,
    /// Retire an instance after this many completed renders
    pub(crate) max_renders_per_instance: u64,
    /// Retire an instance older than this many seconds
    pub(crate) max_instance_age_secs: u64,
    /// Retire an instance idle longer than this many seconds
    pub(crate) idle_timeout_secs: u64,
    /// Interval between idle/health sweeps in seconds
    pub(crate) sweep_interval_secs: u64,
    /// Backoff hint attached to capacity errors, in milliseconds
    pub(crate) retry_after_hint_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 3,
            warm_instances: 0,
            acquire_deadline_ms: 5_000,
            wait_queue_limit: 64,
            max_renders_per_instance: 1_000,
            max_instance_age_secs: 3_600,
            idle_timeout_secs: 300,
            sweep_interval_secs: 30,
            retry_after_hint_ms: 1_000,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Socket address the gateway binds to
    pub(crate) bind_addr: String,
    /// Number of independent pool shards
    pub(crate) shards: usize,
    /// Run engine processes headless
    pub(crate) headless: bool,
    /// Explicit Chromium executable path; discovered when `None`
    pub(crate) chrome_executable: Option<PathBuf>,
    /// Per-shard pool tuning
    pub(crate) pool: PoolConfig,
    /// Keepalive cadence for persistent connections, in seconds
    pub(crate) heartbeat_interval_secs: u64,
    /// Reject documents larger than this many bytes before dispatch
    pub(crate) max_document_bytes: usize,
    /// Reject batches with more calls than this before dispatch
    pub(crate) max_batch_calls: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9777".to_string(),
            shards: 4,
            headless: true,
            chrome_executable: None,
            pool: PoolConfig::default(),
            heartbeat_interval_secs: 30,
            max_document_bytes: 2 * 1024 * 1024,
            max_batch_calls: 32,
        }
    }
}
