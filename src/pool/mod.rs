//! Warm engine pool
//!
//! A shard is a bounded set of engine instances plus a FIFO wait queue,
//! owned by a single worker task ([`manager`]). The [`registry`] builds the
//! shard set at startup; [`recycle`] decides when an instance has served
//! long enough; [`queue`] holds callers waiting for a free instance.

pub mod instance;
pub mod manager;
pub mod queue;
pub mod recycle;
pub mod registry;

pub use instance::{InstanceId, InstanceRecord, InstanceStatus};
pub use manager::{EngineLease, PoolHandle, ReleaseOutcome, ShardStats, spawn_shard};
pub use queue::WaitQueue;
pub use recycle::{RecycleDecision, RecyclePolicy, RetireReason};
pub use registry::PoolRegistry;
