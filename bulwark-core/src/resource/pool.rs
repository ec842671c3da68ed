//! Bounded resource pool with background health checking
//!
//! The pool keeps at most `max_size` resources alive and keeps up to
//! `min_size` of them idle for reuse. A background task started by
//! [`ResourcePool::new`] health-checks every resource on an interval and
//! destroys the unhealthy ones. It runs until [`ResourcePool::shutdown`] is
//! called or the pool is dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorRecord, ResourceFailure, ResourceOperation, Result};
use crate::resource::lifecycle::ResourceHandler;

/// Creates, checks, and destroys the resources a pool manages
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    /// Resource type name used in errors and logs
    fn resource_type(&self) -> &str;

    /// Create a new resource
    async fn create(&self) -> Result<Self::Resource>;

    /// Check whether a resource is still usable
    async fn health_check(&self, resource: &Self::Resource) -> bool;

    /// Tear a resource down
    async fn destroy(&self, resource: &Self::Resource) -> Result<()>;
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle resources kept for reuse
    pub min_size: usize,

    /// Upper bound on live resources
    pub max_size: usize,

    /// Interval between background health checks
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Timeout for a single health check; a timeout counts as unhealthy
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Idle resources older than this are evicted by the background task
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,

    /// Pre-create `min_size` resources on startup
    pub warm_up: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(300),
            warm_up: false,
        }
    }
}

impl PoolConfig {
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    pub fn with_warm_up(mut self, warm_up: bool) -> Self {
        self.warm_up = warm_up;
        self
    }

    /// Check size bounds and intervals
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(ErrorRecord::config("pool.max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(ErrorRecord::config(format!(
                "pool.min_size ({}) must not exceed pool.max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(ErrorRecord::config(
                "pool.health_check_interval must be greater than 0",
            ));
        }
        if self.health_check_timeout.is_zero() {
            return Err(ErrorRecord::config(
                "pool.health_check_timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Result of the most recent health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthRecord {
    pub healthy: bool,
    pub checked_at: Instant,
}

#[derive(Debug)]
struct ResourceMeta {
    alive: AtomicBool,
    acquired_at: Mutex<Instant>,
    last_health: Mutex<Option<HealthRecord>>,
}

/// A pool-managed resource handle
///
/// Clones share the same underlying resource and metadata.
#[derive(Debug)]
pub struct PooledResource<T> {
    id: Uuid,
    resource: Arc<T>,
    created_at: Instant,
    meta: Arc<ResourceMeta>,
}

impl<T> Clone for PooledResource<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            resource: self.resource.clone(),
            created_at: self.created_at,
            meta: self.meta.clone(),
        }
    }
}

impl<T> PooledResource<T> {
    fn new(resource: T) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            resource: Arc::new(resource),
            created_at: now,
            meta: Arc::new(ResourceMeta {
                alive: AtomicBool::new(true),
                acquired_at: Mutex::new(now),
                last_health: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the resource was last handed out
    pub fn acquired_at(&self) -> Instant {
        *self.meta.acquired_at.lock()
    }

    pub fn last_health(&self) -> Option<HealthRecord> {
        *self.meta.last_health.lock()
    }

    /// False once the pool has found the resource unhealthy or destroyed it
    pub fn is_alive(&self) -> bool {
        self.meta.alive.load(Ordering::SeqCst)
    }

    fn mark_acquired(&self) {
        *self.meta.acquired_at.lock() = Instant::now();
    }

    fn record_health(&self, healthy: bool) {
        *self.meta.last_health.lock() = Some(HealthRecord {
            healthy,
            checked_at: Instant::now(),
        });
        if !healthy {
            self.mark_dead();
        }
    }

    fn mark_dead(&self) {
        self.meta.alive.store(false, Ordering::SeqCst);
    }
}

impl<T> Deref for PooledResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub available: usize,
    pub active: usize,
    pub created: u64,
    pub destroyed: u64,
    pub health_check_failures: u64,
}

struct IdleEntry<T> {
    resource: PooledResource<T>,
    idle_since: Instant,
}

struct PoolState<T> {
    available: VecDeque<IdleEntry<T>>,
    active: HashMap<Uuid, PooledResource<T>>,
    /// Released resources still being checked or destroyed
    releasing: HashSet<Uuid>,
    /// Slots reserved by in-flight creates
    pending: usize,
    shut_down: bool,
    created: u64,
    destroyed: u64,
    health_check_failures: u64,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            available: VecDeque::new(),
            active: HashMap::new(),
            releasing: HashSet::new(),
            pending: 0,
            shut_down: false,
            created: 0,
            destroyed: 0,
            health_check_failures: 0,
        }
    }

    /// Remove a resource from whichever set holds it
    fn remove(&mut self, id: Uuid) -> Option<PooledResource<T>> {
        if let Some(pos) = self.available.iter().position(|e| e.resource.id == id) {
            return self.available.remove(pos).map(|e| e.resource);
        }
        self.active.remove(&id)
    }

    /// Remove an idle entry, only if it has not been handed out since `idle_since`
    fn take_idle(&mut self, id: Uuid, idle_since: Instant) -> Option<PooledResource<T>> {
        let pos = self
            .available
            .iter()
            .position(|e| e.resource.id == id && e.idle_since == idle_since)?;
        self.available.remove(pos).map(|e| e.resource)
    }

    fn in_use(&self) -> usize {
        self.active.len() + self.releasing.len() + self.pending
    }

    fn is_released(&self, id: Uuid) -> bool {
        self.releasing.contains(&id) || self.available.iter().any(|e| e.resource.id == id)
    }
}

/// Slot reserved for an in-flight create, given back on drop unless committed
struct PendingSlot<'a, T> {
    state: &'a Mutex<PoolState<T>>,
    committed: bool,
}

impl<T> PendingSlot<'_, T> {
    fn commit(mut self, state: &mut PoolState<T>) {
        self.committed = true;
        state.pending -= 1;
    }
}

impl<T> Drop for PendingSlot<'_, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.state.lock().pending -= 1;
        }
    }
}

enum Reservation<T> {
    Reused(PooledResource<T>),
    Create,
    Exhausted(String),
    ShutDown,
}

struct PoolInner<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Resource>>,
}

impl<F: ResourceFactory> PoolInner<F> {
    fn error(
        &self,
        operation: ResourceOperation,
        failure: ResourceFailure,
        message: &str,
    ) -> ErrorRecord {
        ErrorRecord::resource(operation, failure, self.factory.resource_type(), message)
    }

    async fn create(&self) -> Result<PooledResource<F::Resource>> {
        self.factory.create().await.map(PooledResource::new)
    }

    async fn destroy(&self, resource: PooledResource<F::Resource>) {
        resource.mark_dead();
        if let Err(e) = self.factory.destroy(&resource).await {
            warn!(
                resource_type = self.factory.resource_type(),
                resource_id = %resource.id,
                "Failed to destroy resource: {}",
                e.message()
            );
        }
        self.state.lock().destroyed += 1;
    }

    async fn is_healthy(&self, resource: &PooledResource<F::Resource>) -> bool {
        let healthy = matches!(
            timeout(
                self.config.health_check_timeout,
                self.factory.health_check(resource)
            )
            .await,
            Ok(true)
        );
        resource.record_health(healthy);
        healthy
    }

    async fn acquire(&self) -> Result<PooledResource<F::Resource>> {
        let (reservation, stale) = self.reserve();
        for resource in stale {
            self.destroy(resource).await;
        }

        match reservation {
            Reservation::Reused(resource) => {
                debug!(resource_id = %resource.id, "Reusing pooled resource");
                return Ok(resource);
            }
            Reservation::ShutDown => {
                return Err(self.error(
                    ResourceOperation::Acquire,
                    ResourceFailure::ShutDown,
                    "Pool has been shut down",
                ));
            }
            Reservation::Exhausted(message) => {
                return Err(self.error(
                    ResourceOperation::Acquire,
                    ResourceFailure::Exhausted,
                    &message,
                ));
            }
            Reservation::Create => {}
        }

        let slot = PendingSlot {
            state: &self.state,
            committed: false,
        };
        let resource = match self.create().await {
            Ok(resource) => resource,
            Err(e) => {
                return Err(ErrorRecord::resource(
                    ResourceOperation::Create,
                    ResourceFailure::Failed,
                    self.factory.resource_type(),
                    format!("Failed to create resource: {}", e.message()),
                )
                .with_cause(e));
            }
        };

        let admitted = {
            let mut state = self.state.lock();
            slot.commit(&mut state);
            state.created += 1;
            if !state.shut_down {
                state.active.insert(resource.id, resource.clone());
            }
            !state.shut_down
        };

        if !admitted {
            self.destroy(resource).await;
            return Err(self.error(
                ResourceOperation::Acquire,
                ResourceFailure::ShutDown,
                "Pool shut down while creating resource",
            ));
        }

        debug!(resource_id = %resource.id, "Created pooled resource");
        Ok(resource)
    }

    /// Pick an idle resource or reserve a slot for a new one
    fn reserve(&self) -> (Reservation<F::Resource>, Vec<PooledResource<F::Resource>>) {
        let mut state = self.state.lock();
        let mut stale = Vec::new();
        if state.shut_down {
            return (Reservation::ShutDown, stale);
        }

        while let Some(entry) = state.available.pop_front() {
            if entry.resource.is_alive() {
                let resource = entry.resource;
                resource.mark_acquired();
                state.active.insert(resource.id, resource.clone());
                return (Reservation::Reused(resource), stale);
            }
            stale.push(entry.resource);
        }

        let in_use = state.in_use();
        if in_use >= self.config.max_size {
            let message = format!(
                "Pool exhausted: {} in use of {} max",
                in_use, self.config.max_size
            );
            return (Reservation::Exhausted(message), stale);
        }

        state.pending += 1;
        (Reservation::Create, stale)
    }

    /// Hand a checked-out resource back for disposal.
    ///
    /// Disposal runs on its own task and completes even if this future is
    /// dropped. Releasing a resource that is already released or was evicted
    /// by the pool is a no-op.
    async fn release(inner: &Arc<Self>, resource: PooledResource<F::Resource>) -> Result<()> {
        let claimed = {
            let mut state = inner.state.lock();
            if state.active.remove(&resource.id).is_some() {
                state.releasing.insert(resource.id);
                true
            } else if state.is_released(resource.id) || !resource.is_alive() {
                false
            } else {
                return Err(inner.error(
                    ResourceOperation::Release,
                    ResourceFailure::Failed,
                    &format!("Resource {} is not managed by this pool", resource.id),
                ));
            }
        };

        if !claimed {
            debug!(
                resource_id = %resource.id,
                "Resource already released or evicted"
            );
            return Ok(());
        }

        tokio::spawn(Self::dispose(inner.clone(), resource))
            .await
            .map_err(|e| {
                inner.error(
                    ResourceOperation::Release,
                    ResourceFailure::Failed,
                    &format!("Release task failed: {}", e),
                )
            })
    }

    /// Return a released resource to the idle set, or destroy it
    async fn dispose(self: Arc<Self>, resource: PooledResource<F::Resource>) {
        let healthy = resource.is_alive() && self.is_healthy(&resource).await;

        let retained = {
            let mut state = self.state.lock();
            if !healthy {
                state.health_check_failures += 1;
            }
            let retained =
                healthy && !state.shut_down && state.available.len() < self.config.min_size;
            if retained {
                state.releasing.remove(&resource.id);
                state.available.push_back(IdleEntry {
                    resource: resource.clone(),
                    idle_since: Instant::now(),
                });
            }
            retained
        };

        if !retained {
            let id = resource.id;
            self.destroy(resource).await;
            self.state.lock().releasing.remove(&id);
        }
    }

    /// Health-check every resource and evict idle ones past `max_idle_time`
    async fn maintain(&self) {
        let now = Instant::now();
        let (idle, active): (Vec<_>, Vec<_>) = {
            let state = self.state.lock();
            (
                state
                    .available
                    .iter()
                    .map(|e| (e.resource.clone(), e.idle_since))
                    .collect(),
                state.active.values().cloned().collect(),
            )
        };

        let mut evicted = 0usize;
        let mut unhealthy = 0usize;

        for (resource, idle_since) in idle {
            if now.saturating_duration_since(idle_since) >= self.config.max_idle_time {
                let removed = self.state.lock().take_idle(resource.id, idle_since);
                if let Some(resource) = removed {
                    self.destroy(resource).await;
                    evicted += 1;
                }
                continue;
            }
            if !self.is_healthy(&resource).await {
                unhealthy += self.evict_unhealthy(resource.id).await as usize;
            }
        }

        for resource in active {
            if !self.is_healthy(&resource).await {
                unhealthy += self.evict_unhealthy(resource.id).await as usize;
            }
        }

        if evicted > 0 || unhealthy > 0 {
            info!(
                resource_type = self.factory.resource_type(),
                evicted, unhealthy, "Pool maintenance removed resources"
            );
        }
    }

    async fn evict_unhealthy(&self, id: Uuid) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.remove(id);
            if removed.is_some() {
                state.health_check_failures += 1;
            }
            removed
        };
        match removed {
            Some(resource) => {
                warn!(
                    resource_type = self.factory.resource_type(),
                    resource_id = %id,
                    "Destroying unhealthy resource"
                );
                self.destroy(resource).await;
                true
            }
            None => false,
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            available: state.available.len(),
            active: state.active.len(),
            created: state.created,
            destroyed: state.destroyed,
            health_check_failures: state.health_check_failures,
        }
    }
}

/// Bounded pool of reusable resources
pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create a pool and start its health-check task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(factory: F, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            factory,
            config,
            state: Mutex::new(PoolState::new()),
        });

        if inner.config.warm_up {
            for _ in 0..inner.config.min_size {
                let resource = match inner.create().await {
                    Ok(resource) => resource,
                    Err(e) => {
                        let created: Vec<_> = inner
                            .state
                            .lock()
                            .available
                            .drain(..)
                            .map(|entry| entry.resource)
                            .collect();
                        for resource in created {
                            inner.destroy(resource).await;
                        }
                        return Err(e);
                    }
                };
                let mut state = inner.state.lock();
                state.created += 1;
                state.available.push_back(IdleEntry {
                    resource,
                    idle_since: Instant::now(),
                });
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::run_health_checks(inner.clone(), cancel.clone()));

        info!(
            resource_type = inner.factory.resource_type(),
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "Resource pool started"
        );

        Ok(Self {
            inner,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    async fn run_health_checks(inner: Arc<PoolInner<F>>, cancel: CancellationToken) {
        let period = inner.config.health_check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => inner.maintain().await,
            }
        }
        debug!(
            resource_type = inner.factory.resource_type(),
            "Health-check task stopped"
        );
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Take a resource, creating one if the pool has room
    pub async fn acquire(&self) -> Result<PooledResource<F::Resource>> {
        self.inner.acquire().await
    }

    /// Return a resource to the pool, or destroy it
    pub async fn release(&self, resource: PooledResource<F::Resource>) -> Result<()> {
        PoolInner::release(&self.inner, resource).await
    }

    /// Run one health-check pass immediately
    pub async fn run_health_check(&self) {
        self.inner.maintain().await
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    /// Stop the health-check task and destroy idle resources.
    ///
    /// Active resources are destroyed as they are released.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Health-check task ended abnormally: {}", e);
            }
        }

        let idle: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            state.available.drain(..).map(|e| e.resource).collect()
        };
        for resource in idle {
            self.inner.destroy(resource).await;
        }

        info!(
            resource_type = self.inner.factory.resource_type(),
            "Resource pool shut down"
        );
    }
}

impl<F: ResourceFactory> Drop for ResourcePool<F> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<F: ResourceFactory> std::fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("resource_type", &self.inner.factory.resource_type())
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl<F: ResourceFactory> ResourceHandler for ResourcePool<F> {
    type Resource = PooledResource<F::Resource>;

    fn resource_type(&self) -> &str {
        self.inner.factory.resource_type()
    }

    async fn acquire(&self) -> Result<Self::Resource> {
        ResourcePool::acquire(self).await
    }

    async fn release(&self, resource: Self::Resource) -> Result<()> {
        ResourcePool::release(self, resource).await
    }
}
