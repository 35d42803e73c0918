//! Service configuration
//!
//! Provides the `ServiceConfig`/`PoolConfig` structs and a fluent builder
//! with validation and sensible defaults. Every tuning threshold the pool
//! and gateway consult lives here; nothing in the core hard-codes them.

pub mod builder;
pub mod getters;
pub mod types;

pub use builder::ServiceConfigBuilder;
pub use types::{PoolConfig, ServiceConfig};
