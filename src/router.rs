//! Request routing
//!
//! Maps a tenant identity to a pool shard with a stable hash so a tenant's
//! traffic keeps landing on the same warm instances. When a shard is
//! unreachable the router degrades to a one-off unpooled render — start an
//! engine, render, close — instead of failing the request; fallbacks are
//! counted and logged distinctly so operators can watch the rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::engine::{EngineError, EngineLauncher, RenderEngine, RenderOptions, RenderOutput};
use crate::error::{RenderError, RenderResult};
use crate::pool::{EngineLease, PoolRegistry};

pub(crate) fn engine_error(e: EngineError) -> RenderError {
    match e {
        EngineError::Crashed(msg) => RenderError::InstanceCrash(msg),
        EngineError::Render(msg) => RenderError::RenderFailed(msg),
        EngineError::Launch(msg) => RenderError::CreationFailure(msg),
    }
}

/// An engine held for one render call
///
/// Either a pooled lease (released back to its shard on finish/drop) or a
/// one-off unpooled engine from the fallback path (closed on finish).
pub enum RouteLease {
    Pooled(EngineLease),
    Unpooled(Box<dyn RenderEngine>),
}

impl RouteLease {
    /// Render on the held engine
    pub async fn render(
        &mut self,
        document: &str,
        options: &RenderOptions,
    ) -> Result<RenderOutput, EngineError> {
        match self {
            RouteLease::Pooled(lease) => lease.render(document, options).await,
            RouteLease::Unpooled(engine) => engine.render(document, options).await,
        }
    }

    /// Give the engine back: release to the shard, or close the one-off
    pub async fn finish(self) {
        match self {
            RouteLease::Pooled(lease) => drop(lease),
            RouteLease::Unpooled(mut engine) => engine.close().await,
        }
    }
}

/// Routes render calls to pool shards
pub struct Router {
    registry: Arc<PoolRegistry>,
    launcher: Arc<dyn EngineLauncher>,
    fallback_renders: AtomicU64,
}

impl Router {
    pub fn new(registry: Arc<PoolRegistry>, launcher: Arc<dyn EngineLauncher>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            launcher,
            fallback_renders: AtomicU64::new(0),
        })
    }

    /// Stable shard index for a tenant identity
    pub fn shard_for(&self, identity: &str) -> usize {
        (xxh3_64(identity.as_bytes()) % self.registry.shard_count() as u64) as usize
    }

    /// Cumulative count of unpooled fallback renders
    pub fn fallback_renders(&self) -> u64 {
        self.fallback_renders.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Hold an engine for one call through the tenant's shard
    ///
    /// Capacity errors propagate as backpressure; only an unreachable shard
    /// degrades to the unpooled fallback.
    pub async fn acquire(&self, identity: &str, call_id: &str) -> RenderResult<RouteLease> {
        let shard = self.shard_for(identity);
        let handle = match self.registry.shard(shard) {
            Some(handle) if handle.is_open() => handle,
            _ => return self.acquire_unpooled(identity, call_id).await,
        };

        match handle.acquire(call_id, None).await {
            Ok(lease) => Ok(RouteLease::Pooled(lease)),
            Err(RenderError::PoolUnavailable(_)) => {
                // Shard worker went away between the reachability check and
                // the acquire; serve the request degraded rather than failing.
                self.acquire_unpooled(identity, call_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Render one document through the tenant's shard
    ///
    /// Acquire, render, release on every exit path.
    pub async fn render(
        &self,
        identity: &str,
        call_id: &str,
        document: &str,
        options: &RenderOptions,
    ) -> RenderResult<RenderOutput> {
        let mut lease = self.acquire(identity, call_id).await?;
        let result = lease.render(document, options).await;
        lease.finish().await;
        result.map_err(engine_error)
    }

    /// Degraded path: launch a throwaway engine for a single render
    async fn acquire_unpooled(&self, identity: &str, call_id: &str) -> RenderResult<RouteLease> {
        self.fallback_renders.fetch_add(1, Ordering::Relaxed);
        warn!(
            tenant = %identity,
            call = %call_id,
            fallback = true,
            "shard unreachable, serving unpooled render"
        );
        let engine = self.launcher.launch().await.map_err(engine_error)?;
        Ok(RouteLease::Unpooled(engine))
    }
}
