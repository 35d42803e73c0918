//! Fluent builder for `ServiceConfig` with validation
//!
//! All setters are chainable; `build()` checks cross-field constraints so
//! an invalid configuration is rejected at startup rather than surfacing
//! as a wedged pool at runtime.

use anyhow::{Result, anyhow};
use std::path::PathBuf;

use super::types::{PoolConfig, ServiceConfig};

/// Builder for [`ServiceConfig`]
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    #[must_use]
    pub fn shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    #[must_use]
    pub fn chrome_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.chrome_executable = Some(path.into());
        self
    }

    #[must_use]
    pub fn max_instances(mut self, n: usize) -> Self {
        self.config.pool.max_instances = n;
        self
    }

    #[must_use]
    pub fn warm_instances(mut self, n: usize) -> Self {
        self.config.pool.warm_instances = n;
        self
    }

    #[must_use]
    pub fn acquire_deadline_ms(mut self, ms: u64) -> Self {
        self.config.pool.acquire_deadline_ms = ms;
        self
    }

    #[must_use]
    pub fn wait_queue_limit(mut self, n: usize) -> Self {
        self.config.pool.wait_queue_limit = n;
        self
    }

    #[must_use]
    pub fn max_renders_per_instance(mut self, n: u64) -> Self {
        self.config.pool.max_renders_per_instance = n;
        self
    }

    #[must_use]
    pub fn max_instance_age_secs(mut self, secs: u64) -> Self {
        self.config.pool.max_instance_age_secs = secs;
        self
    }

    #[must_use]
    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.pool.idle_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.pool.sweep_interval_secs = secs;
        self
    }

    #[must_use]
    pub fn retry_after_hint_ms(mut self, ms: u64) -> Self {
        self.config.pool.retry_after_hint_ms = ms;
        self
    }

    #[must_use]
    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_interval_secs = secs;
        self
    }

    #[must_use]
    pub fn max_document_bytes(mut self, bytes: usize) -> Self {
        self.config.max_document_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_batch_calls(mut self, n: usize) -> Self {
        self.config.max_batch_calls = n;
        self
    }

    /// Validate and produce the final configuration
    ///
    /// # Errors
    ///
    /// Returns an error when any threshold is outside its valid range.
    pub fn build(self) -> Result<ServiceConfig> {
        let c = &self.config;
        if c.shards == 0 {
            return Err(anyhow!("shards must be at least 1"));
        }
        if !(1..=5).contains(&c.pool.max_instances) {
            return Err(anyhow!(
                "max_instances must be within 1..=5, got {}",
                c.pool.max_instances
            ));
        }
        if c.pool.warm_instances > c.pool.max_instances {
            return Err(anyhow!(
                "warm_instances ({}) exceeds max_instances ({})",
                c.pool.warm_instances,
                c.pool.max_instances
            ));
        }
        if c.pool.wait_queue_limit == 0 {
            return Err(anyhow!("wait_queue_limit must be at least 1"));
        }
        if c.pool.acquire_deadline_ms == 0 {
            return Err(anyhow!("acquire_deadline_ms must be non-zero"));
        }
        if c.pool.max_renders_per_instance == 0 {
            return Err(anyhow!("max_renders_per_instance must be non-zero"));
        }
        if c.heartbeat_interval_secs == 0 {
            return Err(anyhow!("heartbeat_interval_secs must be non-zero"));
        }
        if c.max_batch_calls == 0 {
            return Err(anyhow!("max_batch_calls must be at least 1"));
        }
        Ok(self.config)
    }
}

impl ServiceConfig {
    /// Start building a configuration from defaults
    #[must_use]
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::new()
    }

    /// Load configuration from a JSON file, then validate it
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, not valid JSON, or the
    /// resulting configuration fails validation.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use anyhow::Context;
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read config file {}", path.as_ref().display())
        })?;
        let config: ServiceConfig =
            serde_json::from_str(&raw).context("failed to parse config file")?;
        ServiceConfigBuilder { config }.build()
    }
}
