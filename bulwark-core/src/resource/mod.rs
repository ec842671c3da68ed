//! Scoped resource lifecycles and health-checked pooling
//!
//! [`ResourceManager::using`] guarantees a resource is released exactly once
//! after the body settles, whether it succeeded, failed or was cancelled.
//! [`ResourcePool`] keeps a bounded set of reusable resources and evicts
//! unhealthy ones from a background task.

pub mod lifecycle;
pub mod pool;

pub use lifecycle::{FnResourceHandler, LifecycleConfig, ResourceHandler, ResourceManager};
pub use pool::{
    HealthRecord, PoolConfig, PoolStats, PooledResource, ResourceFactory, ResourcePool,
};
