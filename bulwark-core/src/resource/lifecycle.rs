//! Resource acquire/release with guaranteed cleanup
//!
//! [`ResourceManager::using`] acquires a resource, hands it to a body, and
//! always releases it afterwards. Acquire and release each run under their
//! own timeout and retry budget. A release failure is reported through
//! telemetry but never replaces the body's outcome.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::attrs;
use crate::error::{ErrorRecord, ResourceFailure, ResourceOperation, Result};
use crate::resilience::retry::{RetryPolicy, with_retry};
use crate::telemetry::Telemetry;

/// Source of acquirable resources
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    /// Handle type. Cloned when a release attempt has to be retried.
    type Resource: Clone + Send + Sync + 'static;

    /// Resource type name used in errors and telemetry
    fn resource_type(&self) -> &str;

    /// Acquire a resource
    async fn acquire(&self) -> Result<Self::Resource>;

    /// Release a resource. Must tolerate being called again for a resource
    /// whose earlier release attempt timed out.
    async fn release(&self, resource: Self::Resource) -> Result<()>;
}

/// Lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Timeout for a single acquire attempt
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Retries after a retryable acquire failure
    pub max_acquire_retries: u32,

    /// Delay before the first acquire retry
    #[serde(with = "humantime_serde")]
    pub acquire_retry_delay: Duration,

    /// Timeout for a single release attempt
    #[serde(with = "humantime_serde")]
    pub release_timeout: Duration,

    /// Retries after a failed release attempt
    pub max_release_retries: u32,

    /// Delay before the first release retry
    #[serde(with = "humantime_serde")]
    pub release_retry_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            max_acquire_retries: 2,
            acquire_retry_delay: Duration::from_millis(100),
            release_timeout: Duration::from_secs(5),
            max_release_retries: 2,
            release_retry_delay: Duration::from_millis(100),
        }
    }
}

impl LifecycleConfig {
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_max_acquire_retries(mut self, retries: u32) -> Self {
        self.max_acquire_retries = retries;
        self
    }

    pub fn with_acquire_retry_delay(mut self, delay: Duration) -> Self {
        self.acquire_retry_delay = delay;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn with_max_release_retries(mut self, retries: u32) -> Self {
        self.max_release_retries = retries;
        self
    }

    pub fn with_release_retry_delay(mut self, delay: Duration) -> Self {
        self.release_retry_delay = delay;
        self
    }

    /// Exhaustion and timeouts are retried; a shut-down source is not
    fn acquire_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_acquire_retries + 1)
            .with_base_delay(self.acquire_retry_delay)
            .with_max_delay(self.acquire_retry_delay * 8)
            .with_jitter(false)
    }

    fn release_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_release_retries + 1)
            .with_base_delay(self.release_retry_delay)
            .with_max_delay(self.release_retry_delay * 8)
            .with_jitter(false)
            .with_retry_if(|_| true)
    }
}

/// Runs bodies against acquired resources with guaranteed release
#[derive(Debug, Clone)]
pub struct ResourceManager {
    config: LifecycleConfig,
    telemetry: Telemetry,
}

impl ResourceManager {
    pub fn new(config: LifecycleConfig, telemetry: Telemetry) -> Self {
        Self { config, telemetry }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Acquire under the configured timeout, retrying retryable failures
    pub async fn acquire<H: ResourceHandler>(&self, handler: &H) -> Result<H::Resource> {
        let acquire_timeout = self.config.acquire_timeout;
        let resource_type = handler.resource_type().to_string();

        with_retry(&self.config.acquire_policy(), |_| {
            let resource_type = resource_type.clone();
            async move {
                match timeout(acquire_timeout, handler.acquire()).await {
                    Ok(result) => result,
                    Err(_) => Err(ErrorRecord::resource(
                        ResourceOperation::Acquire,
                        ResourceFailure::Timeout,
                        resource_type,
                        format!("Acquire timed out after {:?}", acquire_timeout),
                    )),
                }
            }
        })
        .await
    }

    /// Acquire a resource, run `body` against it, and release it.
    ///
    /// Release runs exactly once whether `body` succeeds, fails, or the
    /// returned future is dropped. Release always runs on a spawned task, so
    /// dropping the future while release is in flight does not abandon it.
    pub async fn using<H, T, B>(&self, handler: Arc<H>, body: B) -> Result<T>
    where
        H: ResourceHandler,
        B: for<'r> FnOnce(&'r mut H::Resource) -> BoxFuture<'r, Result<T>>,
    {
        let resource = self.acquire(handler.as_ref()).await?;
        let started = Instant::now();
        debug!(resource_type = handler.resource_type(), "Resource acquired");

        let mut guard = ReleaseGuard {
            resource: Some(resource),
            handler,
            manager: self.clone(),
        };

        let outcome = match guard.resource.as_mut() {
            Some(resource) => body(resource).await,
            None => Err(ErrorRecord::resource(
                ResourceOperation::Release,
                ResourceFailure::Failed,
                guard.handler.resource_type(),
                "Resource released before body ran",
            )),
        };

        if let Some(resource) = guard.resource.take() {
            let release = self.spawn_release(guard.handler.clone(), resource, outcome.is_err());
            if let Err(e) = release.await {
                warn!(
                    resource_type = guard.handler.resource_type(),
                    "Release task ended abnormally: {}", e
                );
            }
        }

        self.telemetry.metric(
            "resource.held_ms",
            started.elapsed().as_millis() as f64,
            &attrs! { "resource_type" => guard.handler.resource_type() },
        );

        outcome
    }

    fn spawn_release<H: ResourceHandler>(
        &self,
        handler: Arc<H>,
        resource: H::Resource,
        body_failed: bool,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .release_reporting(handler.as_ref(), resource, body_failed)
                .await;
        })
    }

    /// Release with timeout and retries; report a final failure without propagating it
    async fn release_reporting<H: ResourceHandler>(
        &self,
        handler: &H,
        resource: H::Resource,
        body_failed: bool,
    ) {
        if let Err(error) = self.release(handler, resource).await {
            warn!(
                resource_type = handler.resource_type(),
                body_failed,
                "Resource release failed: {}",
                error.message()
            );
            self.telemetry.error(
                &error,
                &attrs! {
                    "resource_type" => handler.resource_type(),
                    "body_failed" => body_failed,
                },
            );
            self.telemetry.event(
                "resource.release.failed",
                &attrs! { "resource_type" => handler.resource_type() },
            );
        }
    }

    /// Release under the configured timeout, retrying failed attempts
    pub async fn release<H: ResourceHandler>(
        &self,
        handler: &H,
        resource: H::Resource,
    ) -> Result<()> {
        let release_timeout = self.config.release_timeout;
        let resource_type = handler.resource_type().to_string();

        with_retry(&self.config.release_policy(), |_| {
            let resource = resource.clone();
            let resource_type = resource_type.clone();
            async move {
                match timeout(release_timeout, handler.release(resource)).await {
                    Ok(result) => result,
                    Err(_) => Err(ErrorRecord::resource(
                        ResourceOperation::Release,
                        ResourceFailure::Timeout,
                        resource_type,
                        format!("Release timed out after {:?}", release_timeout),
                    )),
                }
            }
        })
        .await
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(LifecycleConfig::default(), Telemetry::default())
    }
}

/// Releases the held resource if `using` is dropped before it could
struct ReleaseGuard<H: ResourceHandler> {
    resource: Option<H::Resource>,
    handler: Arc<H>,
    manager: ResourceManager,
}

impl<H: ResourceHandler> Drop for ReleaseGuard<H> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                debug!(
                    resource_type = self.handler.resource_type(),
                    "Body cancelled, releasing resource in background"
                );
                self.manager
                    .spawn_release(self.handler.clone(), resource, true);
            }
            Err(_) => {
                warn!(
                    resource_type = self.handler.resource_type(),
                    "No runtime available to release resource on cancellation"
                );
            }
        }
    }
}

type AcquireFn<R> = Box<dyn Fn() -> BoxFuture<'static, Result<R>> + Send + Sync>;
type ReleaseFn<R> = Box<dyn Fn(R) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Adapts a pair of closures into a [`ResourceHandler`]
pub struct FnResourceHandler<R> {
    resource_type: String,
    acquire: AcquireFn<R>,
    release: ReleaseFn<R>,
    _resource: PhantomData<fn() -> R>,
}

impl<R> FnResourceHandler<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new<A, AF, L, LF>(resource_type: impl Into<String>, acquire: A, release: L) -> Self
    where
        A: Fn() -> AF + Send + Sync + 'static,
        AF: Future<Output = Result<R>> + Send + 'static,
        L: Fn(R) -> LF + Send + Sync + 'static,
        LF: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            resource_type: resource_type.into(),
            acquire: Box::new(move || Box::pin(acquire())),
            release: Box::new(move |resource| Box::pin(release(resource))),
            _resource: PhantomData,
        }
    }
}

#[async_trait]
impl<R> ResourceHandler for FnResourceHandler<R>
where
    R: Clone + Send + Sync + 'static,
{
    type Resource = R;

    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    async fn acquire(&self) -> Result<R> {
        (self.acquire)().await
    }

    async fn release(&self, resource: R) -> Result<()> {
        (self.release)(resource).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ToolFailure};
    use crate::telemetry::InMemoryTelemetry;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        released: Arc<AtomicU32>,
        release_failures: AtomicU32,
        acquire_delay: Duration,
        release_delay: Duration,
    }

    impl CountingHandler {
        fn new(release_failures: u32) -> Self {
            Self {
                released: Arc::new(AtomicU32::new(0)),
                release_failures: AtomicU32::new(release_failures),
                acquire_delay: Duration::ZERO,
                release_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ResourceHandler for CountingHandler {
        type Resource = u32;

        fn resource_type(&self) -> &str {
            "counter"
        }

        async fn acquire(&self) -> Result<u32> {
            tokio::time::sleep(self.acquire_delay).await;
            Ok(7)
        }

        async fn release(&self, _resource: u32) -> Result<()> {
            tokio::time::sleep(self.release_delay).await;
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.release_failures.load(Ordering::SeqCst) > 0 {
                self.release_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ErrorRecord::resource(
                    ResourceOperation::Release,
                    ResourceFailure::Failed,
                    "counter",
                    "release refused",
                ));
            }
            Ok(())
        }
    }

    fn manager(telemetry: Arc<InMemoryTelemetry>) -> ResourceManager {
        ResourceManager::new(
            LifecycleConfig::default()
                .with_acquire_timeout(Duration::from_millis(50))
                .with_release_retry_delay(Duration::from_millis(1)),
            Telemetry::new(telemetry),
        )
    }

    #[tokio::test]
    async fn test_release_after_success() {
        let handler = Arc::new(CountingHandler::new(0));
        let manager = manager(Arc::new(InMemoryTelemetry::new()));

        let value = manager
            .using(handler.clone(), |r| async move { Ok(*r * 2) }.boxed())
            .await
            .unwrap();

        assert_eq!(value, 14);
        assert_eq!(handler.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_body_error_wins_over_release_error() {
        let handler = Arc::new(CountingHandler::new(u32::MAX));
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let manager = manager(telemetry.clone()).clone();
        let manager = ResourceManager::new(
            manager.config().clone().with_max_release_retries(0),
            Telemetry::new(telemetry.clone()),
        );

        let result: Result<()> = manager
            .using(handler.clone(), |_| {
                async { Err(ErrorRecord::tool(ToolFailure::Execution, "t", "body failed")) }
                    .boxed()
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Tool {
                failure: ToolFailure::Execution
            }
        );
        assert_eq!(error.message(), "body failed");
        assert_eq!(handler.released.load(Ordering::SeqCst), 1);
        assert_eq!(telemetry.count_events("resource.release.failed"), 1);
    }

    #[tokio::test]
    async fn test_release_is_retried() {
        let handler = Arc::new(CountingHandler::new(2));
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let manager = manager(telemetry.clone());

        manager
            .using(handler.clone(), |_| async { Ok(()) }.boxed())
            .await
            .unwrap();

        assert_eq!(handler.released.load(Ordering::SeqCst), 3);
        assert_eq!(telemetry.count_events("resource.release.failed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let mut handler = CountingHandler::new(0);
        handler.acquire_delay = Duration::from_secs(1);
        let handler = Arc::new(handler);
        let manager = manager(Arc::new(InMemoryTelemetry::new()));

        let result: Result<()> = manager
            .using(handler.clone(), |_| async { Ok(()) }.boxed())
            .await;

        assert_eq!(
            result.unwrap_err().kind(),
            &ErrorKind::Resource {
                operation: ResourceOperation::Acquire,
                failure: ResourceFailure::Timeout
            }
        );
        assert_eq!(handler.released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_on_cancellation() {
        let handler = Arc::new(CountingHandler::new(0));
        let manager = manager(Arc::new(InMemoryTelemetry::new()));

        let pending = manager.using(handler.clone(), |_| {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            .boxed()
        });
        let cancelled = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(cancelled.is_err());

        for _ in 0..50 {
            if handler.released.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_finishes_after_caller_stops_waiting() {
        let mut handler = CountingHandler::new(0);
        handler.release_delay = Duration::from_millis(200);
        let handler = Arc::new(handler);
        let manager = manager(Arc::new(InMemoryTelemetry::new()));

        let pending = manager.using(handler.clone(), |_| async { Ok(()) }.boxed());
        let cancelled = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(cancelled.is_err());
        assert_eq!(handler.released.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handler.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeouts_are_retried() {
        let mut handler = CountingHandler::new(0);
        handler.acquire_delay = Duration::from_secs(1);
        let handler = Arc::new(handler);
        let manager = manager(Arc::new(InMemoryTelemetry::new()));

        let started = Instant::now();
        let result: Result<()> = manager
            .using(handler.clone(), |_| async { Ok(()) }.boxed())
            .await;

        assert!(result.is_err());
        // three 50ms attempts separated by 100ms and 200ms backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(450), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = released.clone();
        let handler = Arc::new(FnResourceHandler::new(
            "conn",
            || async { Ok(String::from("conn-1")) },
            move |conn: String| {
                let counter = counter.clone();
                async move {
                    assert_eq!(conn, "conn-1");
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));
        let manager = ResourceManager::default();

        let len = manager
            .using(handler, |conn| async move { Ok(conn.len()) }.boxed())
            .await
            .unwrap();

        assert_eq!(len, 6);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
