//! Read accessors for configuration values
//!
//! Duration-valued thresholds are stored as integer fields for serde
//! friendliness and materialized as `Duration` here, at the only place
//! the rest of the crate reads them.

use std::path::Path;
use std::time::Duration;

use super::types::{PoolConfig, ServiceConfig};

impl PoolConfig {
    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn warm_instances(&self) -> usize {
        self.warm_instances
    }

    /// Default deadline applied to `acquire()` calls
    pub fn acquire_deadline(&self) -> Duration {
        Duration::from_millis(self.acquire_deadline_ms)
    }

    pub fn wait_queue_limit(&self) -> usize {
        self.wait_queue_limit
    }

    pub fn max_renders_per_instance(&self) -> u64 {
        self.max_renders_per_instance
    }

    pub fn max_instance_age(&self) -> Duration {
        Duration::from_secs(self.max_instance_age_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Backoff hint attached to capacity-exceeded errors
    pub fn retry_after_hint(&self) -> Duration {
        Duration::from_millis(self.retry_after_hint_ms)
    }
}

impl ServiceConfig {
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    pub fn headless(&self) -> bool {
        self.headless
    }

    pub fn chrome_executable(&self) -> Option<&Path> {
        self.chrome_executable.as_deref()
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Grace window before a silent persistent connection is dropped
    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 2)
    }

    pub fn max_document_bytes(&self) -> usize {
        self.max_document_bytes
    }

    pub fn max_batch_calls(&self) -> usize {
        self.max_batch_calls
    }
}
