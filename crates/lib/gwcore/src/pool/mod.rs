mod manager;

pub use manager::PoolManager;

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Minimum backoff observed between an unhealthy-construction retry and the next attempt.
const MIN_UNHEALTHY_BACKOFF: Duration = Duration::from_millis(100);

/// Application-supplied resource managed by the pool.
///
/// Exclusively owned by whichever caller currently holds it; ownership
/// transfers back to the pool on `put`.
#[async_trait]
pub trait PooledClient: Send + Sync + 'static {
    async fn close(&mut self) -> Result<()>;
    async fn is_healthy(&self, deadline: Instant) -> bool;
}

/// Item placed on the idle queue: either a live client (tagged with the
/// instant it went idle, consulted by the idle reaper) or a wake-up token
/// that costs no permit.
enum PoolItem<T> {
    Client(T, Instant),
    Retry,
}

/// Result of a panic-protected health check, carrying the client back to
/// the caller either way so a non-panicking outcome never drops it.
enum HealthOutcome<T> {
    Healthy(T),
    Unhealthy(T),
}

/// Pool configuration. Validated by [`PoolConfig::validate`].
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub initial: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub disable_health_check: bool,
}

fn default_max_idle() -> usize {
    4
}
fn default_max_active() -> usize {
    8
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial: 0,
            max_idle: default_max_idle(),
            max_active: default_max_active(),
            idle_timeout: default_idle_timeout(),
            disable_health_check: false,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(GatewayError::ConfigInvalid(
                "maxActive must be > 0".into(),
            ));
        }
        if self.max_idle > self.max_active {
            return Err(GatewayError::ConfigInvalid(
                "maxIdle must be <= maxActive".into(),
            ));
        }
        if self.initial > self.max_idle {
            return Err(GatewayError::ConfigInvalid(
                "initial must be <= maxIdle".into(),
            ));
        }
        Ok(())
    }
}

/// Factory producing new pooled clients.
#[async_trait]
pub trait ClientFactory<T: PooledClient>: Send + Sync + 'static {
    async fn create(&self) -> Result<T>;
}

#[async_trait]
impl<T, F, Fut> ClientFactory<T> for F
where
    T: PooledClient,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    async fn create(&self) -> Result<T> {
        (self)().await
    }
}

struct Inner<T: PooledClient> {
    active: AtomicUsize,
    closed: AtomicBool,
    max_active: usize,
    idle_timeout: Duration,
    disable_health_check: bool,
    idle_tx: mpsc::Sender<PoolItem<T>>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<PoolItem<T>>>,
    close_guard: RwLock<()>,
    factory: Arc<dyn ClientFactory<T>>,
}

/// Generic pool of health-checked, admission-controlled resources.
///
/// Mirrors the invariants of a classical connection pool: the `active`
/// counter (never the idle-queue length) is the authoritative measure of
/// outstanding permits, and every code path that acquires a permit releases
/// it on every exit.
pub struct Pool<T: PooledClient> {
    inner: Arc<Inner<T>>,
}

impl<T: PooledClient> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: PooledClient> Pool<T> {
    /// Construct a pool, pre-allocating `config.initial` clients via `factory`.
    pub async fn new<F: ClientFactory<T>>(config: PoolConfig, factory: F) -> Result<Self> {
        config.validate()?;
        let (idle_tx, idle_rx) = mpsc::channel(config.max_idle.max(1));
        let inner = Arc::new(Inner {
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            max_active: config.max_active,
            idle_timeout: config.idle_timeout,
            disable_health_check: config.disable_health_check,
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            close_guard: RwLock::new(()),
            factory: Arc::new(factory),
        });
        let pool = Self { inner };
        for _ in 0..config.initial {
            let client = pool.inner.factory.create().await?;
            pool.inner.active.fetch_add(1, Ordering::SeqCst);
            let _ = pool
                .inner
                .idle_tx
                .try_send(PoolItem::Client(client, Instant::now()));
        }
        spawn_idle_reaper(Arc::downgrade(&pool.inner));
        Ok(pool)
    }

    /// Idle-queue length — informational only.
    pub fn len(&self) -> usize {
        self.inner.idle_tx.max_capacity() - self.inner.idle_tx.capacity()
    }

    fn try_acquire(&self, n: usize) -> bool {
        loop {
            let current = self.inner.active.load(Ordering::SeqCst);
            if current + n > self.inner.max_active {
                return false;
            }
            if self
                .inner
                .active
                .compare_exchange(current, current + n, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            std::thread::yield_now();
        }
    }

    fn release(&self, n: usize) {
        self.inner.active.fetch_sub(n, Ordering::SeqCst);
    }

    /// Obtain a healthy client, blocking until one is available, the pool
    /// closes, or `deadline` elapses.
    pub async fn get(&self, deadline: Instant) -> Result<T> {
        loop {
            if Instant::now() >= deadline {
                return Err(GatewayError::Cancelled);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(GatewayError::PoolClosed);
            }

            if let Some(item) = self.try_take_idle() {
                match item {
                    PoolItem::Retry => continue,
                    PoolItem::Client(client, _) => {
                        match self.check_health(client, deadline).await {
                            HealthOutcome::Healthy(client) => return Ok(client),
                            HealthOutcome::Unhealthy(client) => {
                                self.discard_unhealthy(client).await;
                                continue;
                            }
                        }
                    }
                }
            }

            if self.try_acquire(1) {
                // Re-check: a concurrent Put may have raced us between the
                // non-blocking idle take above and the acquire.
                if let Some(item) = self.try_take_idle() {
                    self.release(1);
                    match item {
                        PoolItem::Retry => continue,
                        PoolItem::Client(client, _) => {
                            match self.check_health(client, deadline).await {
                                HealthOutcome::Healthy(client) => return Ok(client),
                                HealthOutcome::Unhealthy(client) => {
                                    self.discard_unhealthy(client).await;
                                    continue;
                                }
                            }
                        }
                    }
                }

                if self.inner.closed.load(Ordering::SeqCst) {
                    self.release(1);
                    return Err(GatewayError::PoolClosed);
                }

                let built = futures_util::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
                    self.inner.factory.create(),
                ))
                .await;
                let client = match built {
                    Ok(Ok(client)) => client,
                    Ok(Err(err)) => {
                        self.release(1);
                        return Err(err);
                    }
                    Err(panic) => {
                        self.release(1);
                        std::panic::resume_unwind(panic);
                    }
                };

                if self.inner.closed.load(Ordering::SeqCst) {
                    let mut client = client;
                    let _ = client.close().await;
                    self.release(1);
                    return Err(GatewayError::PoolClosed);
                }

                match self.check_health(client, deadline).await {
                    HealthOutcome::Healthy(client) => return Ok(client),
                    HealthOutcome::Unhealthy(client) => {
                        self.discard_unhealthy(client).await;
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        let backoff = MIN_UNHEALTHY_BACKOFF.min(remaining);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                }
            }

            // Admission denied: wait for an idle item or the deadline.
            let wait = deadline.saturating_duration_since(Instant::now());
            let mut rx = self.inner.idle_rx.lock().await;
            match timeout(wait, rx.recv()).await {
                Ok(Some(item)) => match item {
                    PoolItem::Retry => continue,
                    PoolItem::Client(client, _) => {
                        drop(rx);
                        match self.check_health(client, deadline).await {
                            HealthOutcome::Healthy(client) => return Ok(client),
                            HealthOutcome::Unhealthy(client) => {
                                self.discard_unhealthy(client).await;
                                continue;
                            }
                        }
                    }
                },
                Ok(None) => return Err(GatewayError::PoolClosed),
                Err(_) => return Err(GatewayError::Cancelled),
            }
        }
    }

    fn try_take_idle(&self) -> Option<PoolItem<T>> {
        self.inner.idle_rx.try_lock().ok().and_then(|mut rx| rx.try_recv().ok())
    }

    /// Health-check `client` under panic protection. The caller holds one
    /// permit for `client` on entry; on panic this releases it and
    /// best-effort closes the client before re-raising, so no permit or
    /// client handle leaks out of a panicking health check.
    async fn check_health(&self, mut client: T, deadline: Instant) -> HealthOutcome<T> {
        if self.inner.disable_health_check {
            return HealthOutcome::Healthy(client);
        }
        let checked = futures_util::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
            client.is_healthy(deadline),
        ))
        .await;
        match checked {
            Ok(true) => HealthOutcome::Healthy(client),
            Ok(false) => HealthOutcome::Unhealthy(client),
            Err(panic) => {
                warn!("health check panicked, closing client and releasing permit");
                let _ = client.close().await;
                self.release(1);
                std::panic::resume_unwind(panic);
            }
        }
    }

    async fn discard_unhealthy(&self, mut client: T) {
        let _ = client.close().await;
        self.release(1);
        // Wake any other waiter blocked on the idle channel; costs no permit.
        let _ = self.inner.idle_tx.try_send(PoolItem::Retry);
    }

    /// Return a client to the pool. The pool decides whether to keep or
    /// discard it; health is never checked here.
    pub async fn put(&self, client: Option<T>) {
        let Some(mut client) = client else {
            // Absent handle: caller lost ownership, permit must still be recovered.
            self.release(1);
            return;
        };

        if self.inner.closed.load(Ordering::SeqCst) {
            let _ = client.close().await;
            self.release(1);
            return;
        }

        let _guard = self.inner.close_guard.read().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            drop(_guard);
            let _ = client.close().await;
            self.release(1);
            return;
        }

        match self
            .inner
            .idle_tx
            .try_send(PoolItem::Client(client, Instant::now()))
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                if let PoolItem::Client(mut client, _) = item {
                    let _ = client.close().await;
                }
                self.release(1);
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                if let PoolItem::Client(mut client, _) = item {
                    let _ = client.close().await;
                }
                self.release(1);
            }
        }
    }

    /// Terminate the pool. Idempotent: every idle item is closed exactly once.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.inner.close_guard.write().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing pool");
        let mut rx = self.inner.idle_rx.lock().await;
        rx.close();
        while let Ok(item) = rx.try_recv() {
            if let PoolItem::Client(mut client, _) = item {
                let _ = client.close().await;
                self.release(1);
            }
        }
        Ok(())
    }
}

/// Periodically evict idle clients that have sat past `idle_timeout`,
/// following `ClientPool::spawn_reaper`'s shape: a fixed-interval
/// background task operating on state captured at schedule time. A
/// `Weak` reference lets the task exit once every `Pool<T>` handle drops;
/// a zero timeout disables the reaper entirely.
fn spawn_idle_reaper<T: PooledClient>(inner: Weak<Inner<T>>) {
    let idle_timeout = match inner.upgrade() {
        Some(inner) => inner.idle_timeout,
        None => return,
    };
    if idle_timeout.is_zero() {
        return;
    }
    let interval = (idle_timeout / 4).max(Duration::from_millis(50));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            reap_idle(&inner).await;
        }
    });
}

async fn reap_idle<T: PooledClient>(inner: &Inner<T>) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    let mut rx = inner.idle_rx.lock().await;
    let mut survivors = Vec::new();
    while let Ok(item) = rx.try_recv() {
        match item {
            PoolItem::Retry => survivors.push(PoolItem::Retry),
            PoolItem::Client(client, since) => {
                if since.elapsed() >= inner.idle_timeout {
                    let mut client = client;
                    let _ = client.close().await;
                    inner.active.fetch_sub(1, Ordering::SeqCst);
                    debug!("idle reaper closed expired client");
                } else {
                    survivors.push(PoolItem::Client(client, since));
                }
            }
        }
    }
    for item in survivors {
        let _ = inner.idle_tx.try_send(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration as StdDuration;

    struct Dummy {
        healthy: bool,
        closed: Arc<StdAtomicUsize>,
    }

    #[async_trait]
    impl PooledClient for Dummy {
        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn is_healthy(&self, _deadline: Instant) -> bool {
            self.healthy
        }
    }

    struct PanicsOnHealthCheck {
        closed: Arc<StdAtomicUsize>,
    }

    #[async_trait]
    impl PooledClient for PanicsOnHealthCheck {
        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn is_healthy(&self, _deadline: Instant) -> bool {
            panic!("health check exploded");
        }
    }

    fn deadline(ms: u64) -> Instant {
        Instant::now() + StdDuration::from_millis(ms)
    }

    #[tokio::test]
    async fn get_put_round_trip() {
        let closed = Arc::new(StdAtomicUsize::new(0));
        let closed2 = closed.clone();
        let pool = Pool::new(
            PoolConfig {
                initial: 0,
                max_idle: 1,
                max_active: 1,
                idle_timeout: StdDuration::from_secs(1),
                disable_health_check: false,
            },
            move || {
                let closed = closed2.clone();
                async move {
                    Ok(Dummy {
                        healthy: true,
                        closed,
                    })
                }
            },
        )
        .await
        .unwrap();

        let client = pool.get(deadline(100)).await.unwrap();
        pool.put(Some(client)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn put_nil_releases_permit_without_enqueue() {
        let pool = Pool::new(
            PoolConfig {
                max_idle: 1,
                max_active: 1,
                ..Default::default()
            },
            || async {
                Ok(Dummy {
                    healthy: true,
                    closed: Arc::new(StdAtomicUsize::new(0)),
                })
            },
        )
        .await
        .unwrap();

        let _client = pool.get(deadline(100)).await.unwrap();
        pool.put(None).await;
        // permit released: a fresh Get should succeed promptly.
        let second = pool.get(deadline(100)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn starvation_on_unhealthy_return() {
        let closed = Arc::new(StdAtomicUsize::new(0));
        let created = Arc::new(StdAtomicUsize::new(0));
        let created2 = created.clone();
        let closed2 = closed.clone();
        let pool = Pool::new(
            PoolConfig {
                max_idle: 1,
                max_active: 1,
                ..Default::default()
            },
            move || {
                let closed = closed2.clone();
                let created = created2.clone();
                created.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(Dummy {
                        healthy: true,
                        closed,
                    })
                }
            },
        )
        .await
        .unwrap();

        let mut c1 = pool.get(deadline(100)).await.unwrap();
        c1.healthy = false;
        pool.put(Some(c1)).await;

        let c2 = pool.get(deadline(1000)).await.unwrap();
        assert!(c2.healthy);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_then_get_returns_pool_closed() {
        let pool = Pool::new(PoolConfig::default(), || async {
            Ok(Dummy {
                healthy: true,
                closed: Arc::new(StdAtomicUsize::new(0)),
            })
        })
        .await
        .unwrap();

        pool.close().await.unwrap();
        pool.close().await.unwrap(); // idempotent
        let result = pool.get(deadline(50)).await;
        assert!(matches!(result, Err(GatewayError::PoolClosed)));
    }

    #[tokio::test]
    async fn factory_panic_releases_permit() {
        let attempt = Arc::new(StdAtomicUsize::new(0));
        let attempt2 = attempt.clone();
        let pool = Pool::new(
            PoolConfig {
                max_active: 1,
                max_idle: 1,
                ..Default::default()
            },
            move || {
                let attempt = attempt2.clone();
                async move {
                    let n = attempt.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        panic!("factory exploded");
                    }
                    Ok(Dummy {
                        healthy: true,
                        closed: Arc::new(StdAtomicUsize::new(0)),
                    })
                }
            },
        )
        .await
        .unwrap();

        let first = futures_util::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
            pool.get(deadline(100)),
        ))
        .await;
        assert!(first.is_err());

        let second = pool.get(deadline(100)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn health_check_panic_releases_permit_and_closes_client() {
        let closed = Arc::new(StdAtomicUsize::new(0));
        let closed2 = closed.clone();
        let pool = Pool::new(
            PoolConfig {
                max_active: 1,
                max_idle: 1,
                ..Default::default()
            },
            move || {
                let closed = closed2.clone();
                async move { Ok(PanicsOnHealthCheck { closed }) }
            },
        )
        .await
        .unwrap();

        let first = futures_util::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
            pool.get(deadline(100)),
        ))
        .await;
        assert!(first.is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // permit released: a second Get (against a factory that would
        // panic again) still proves the pool isn't wedged, even though it
        // too panics on health check.
        let second = futures_util::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
            pool.get(deadline(100)),
        ))
        .await;
        assert!(second.is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_reaper_closes_clients_past_idle_timeout() {
        let closed = Arc::new(StdAtomicUsize::new(0));
        let closed2 = closed.clone();
        let pool = Pool::new(
            PoolConfig {
                max_idle: 2,
                max_active: 2,
                idle_timeout: StdDuration::from_millis(10),
                ..Default::default()
            },
            move || {
                let closed = closed2.clone();
                async move {
                    Ok(Dummy {
                        healthy: true,
                        closed,
                    })
                }
            },
        )
        .await
        .unwrap();

        let client = pool.get(deadline(100)).await.unwrap();
        pool.put(Some(client)).await;
        assert_eq!(pool.len(), 1);

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        reap_idle(&pool.inner).await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 0);

        // the permit the reaper released is available to a fresh Get.
        let fresh = pool.get(deadline(100)).await;
        assert!(fresh.is_ok());
    }
}
