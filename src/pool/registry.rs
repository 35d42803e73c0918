//! Shard registry
//!
//! Explicit mapping from shard index to pool handle, constructed once at
//! process start and passed to the router and gateway. Owns startup and
//! shutdown of every shard; there is no ambient global pool state.

use std::sync::Arc;
use tracing::info;

use crate::config::ServiceConfig;
use crate::engine::EngineLauncher;

use super::manager::{PoolHandle, ShardStats, spawn_shard};

/// All pool shards of one process
pub struct PoolRegistry {
    shards: Vec<PoolHandle>,
}

impl PoolRegistry {
    /// Start every shard worker
    pub fn start(config: &ServiceConfig, launcher: Arc<dyn EngineLauncher>) -> Arc<Self> {
        let shards = (0..config.shards())
            .map(|shard| spawn_shard(shard, config.pool().clone(), Arc::clone(&launcher)))
            .collect::<Vec<_>>();
        info!(
            shards = shards.len(),
            max_instances = config.pool().max_instances(),
            "pool registry started"
        );
        Arc::new(Self { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Handle for a shard index; panics only on an out-of-range index bug
    pub fn shard(&self, index: usize) -> Option<&PoolHandle> {
        self.shards.get(index)
    }

    pub fn shards(&self) -> &[PoolHandle] {
        &self.shards
    }

    /// Snapshot every shard's counters; unreachable shards are skipped
    pub async fn stats(&self) -> Vec<ShardStats> {
        let mut all = Vec::with_capacity(self.shards.len());
        for handle in &self.shards {
            if let Ok(stats) = handle.stats().await {
                all.push(stats);
            }
        }
        all
    }

    /// Drain every shard; idle engines close, busy ones close on release
    pub async fn shutdown(&self) {
        info!("pool registry shutting down");
        for handle in &self.shards {
            handle.shutdown().await;
        }
        info!("pool registry shutdown complete");
    }
}
