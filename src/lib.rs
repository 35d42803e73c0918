//! platen — warm-pool HTML rendering service
//!
//! Renders HTML documents into paginated PDF output through a bounded pool
//! of pre-warmed headless Chromium instances. Each pool shard is owned by a
//! single worker task (all state mutations serialize through its mailbox);
//! the gateway multiplexes many render calls, including dependent ones, over
//! one connection and dispatches them through the shard router.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod router;

pub use config::{PoolConfig, ServiceConfig, ServiceConfigBuilder};
pub use engine::{
    ChromiumEngine, ChromiumLauncher, EngineError, EngineLauncher, PageFormat, RenderEngine,
    RenderOptions, RenderOutput,
};
pub use error::{RenderError, RenderResult};
pub use gateway::{GatewayState, SessionManager, app};
pub use pool::{
    EngineLease, InstanceId, InstanceRecord, InstanceStatus, PoolHandle, PoolRegistry,
    RecycleDecision, RecyclePolicy, ReleaseOutcome, RetireReason, ShardStats, spawn_shard,
};
pub use router::{RouteLease, Router};
