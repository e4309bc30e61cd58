//! Warm worker pools keyed on the compile flag.
//!
//! Each flag owns a semaphore with `max_instances` permits and a stack of
//! idle instances. A request holds a permit for as long as it holds an
//! instance, and a new instance is only activated when no idle one exists,
//! so a flag never has more than `max_instances` instances and no instance is
//! ever leased to two requests at once.

use std::{
    num::NonZeroUsize,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

use crate::{
    error::{Result, ServerError},
    worker::{WorkerFactory, WorkerInstance},
};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_instances: NonZeroUsize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: NonZeroUsize::MIN,
            idle_timeout: Duration::from_secs(10 * 60),
        }
    }
}

struct InstancePool {
    idle: Mutex<Vec<WorkerInstance>>,
    permits: Arc<Semaphore>,
}

impl InstancePool {
    fn new(max_instances: NonZeroUsize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_instances.get())),
        }
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<WorkerInstance>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    factory: Arc<dyn WorkerFactory>,
    pools: [Arc<InstancePool>; 2],
    config: PoolConfig,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(factory: Arc<dyn WorkerFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            pools: [
                Arc::new(InstancePool::new(config.max_instances)),
                Arc::new(InstancePool::new(config.max_instances)),
            ],
            config,
            next_id: AtomicU64::new(0),
        }
    }

    fn pool(&self, compile: bool) -> &Arc<InstancePool> {
        &self.pools[usize::from(compile)]
    }

    /// Waits for capacity in the `compile` pool, then leases an idle instance
    /// or activates a new one.
    pub async fn acquire(&self, compile: bool) -> Result<WorkerLease> {
        let pool = self.pool(compile);
        let permit = Arc::clone(&pool.permits)
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Internal("worker pool is closed".to_string()))?;

        let idle = pool.idle().pop();
        let (instance, permit) = match idle {
            Some(instance) => (instance, permit),
            None => self.activate(compile, permit).await?,
        };
        tracing::debug!(instance = instance.id(), compile, "leased worker");

        Ok(WorkerLease {
            instance: Some(instance),
            home: Arc::clone(pool),
            _permit: permit,
        })
    }

    /// The activation task owns `permit` until it hands the instance back.
    /// If the caller has gone away by then (request timeout), the instance
    /// is parked as idle before the permit is released, so an abandoned
    /// activation still counts against `max_instances`.
    async fn activate(
        &self,
        compile: bool,
        permit: OwnedSemaphorePermit,
    ) -> Result<(WorkerInstance, OwnedSemaphorePermit)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let factory = Arc::clone(&self.factory);
        let home = Arc::clone(self.pool(compile));
        let (tx, rx) = oneshot::channel();
        tracing::info!(instance = id, compile, "activating worker");

        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let activated = factory.activate(compile).map(|model| {
                tracing::info!(
                    instance = id,
                    compile,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "worker activated"
                );
                WorkerInstance::new(id, compile, model)
            });

            if let Err((activated, permit)) = tx.send((activated, permit)) {
                if let Ok(instance) = activated {
                    tracing::info!(instance = id, compile, "parking worker activated for an abandoned request");
                    home.idle().push(instance);
                }
                drop(permit);
            }
        });

        let (activated, permit) = rx
            .await
            .map_err(|_| ServerError::Internal("activation task failed".to_string()))?;
        let instance = activated.map_err(|e| {
            tracing::error!(instance = id, compile, error = %format!("{e:#}"), "worker activation failed");
            ServerError::Activation(format!("{e:#}"))
        })?;
        Ok((instance, permit))
    }

    /// Activates one instance ahead of traffic and parks it as idle.
    pub async fn preload(&self, compile: bool) -> Result<()> {
        let lease = self.acquire(compile).await?;
        drop(lease);
        Ok(())
    }

    pub fn idle_count(&self, compile: bool) -> usize {
        self.pool(compile).idle().len()
    }

    /// Tears down instances idle for at least `idle_timeout` as of `now`.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for pool in &self.pools {
            let mut idle = pool.idle();
            let before = idle.len();
            idle.retain(|instance| {
                let keep = now.saturating_duration_since(instance.last_used()) < self.config.idle_timeout;
                if !keep {
                    tracing::info!(
                        instance = instance.id(),
                        compile = instance.compile(),
                        uptime_secs = now.saturating_duration_since(instance.activated_at()).as_secs(),
                        "tearing down idle worker"
                    );
                }
                keep
            });
            evicted += before - idle.len();
        }
        evicted
    }

    pub fn spawn_reaper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                self.evict_idle(Instant::now());
            }
        })
    }
}

/// Exclusive use of one instance. Dropping the lease parks the instance as
/// idle before the capacity permit is released.
pub struct WorkerLease {
    instance: Option<WorkerInstance>,
    home: Arc<InstancePool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for WorkerLease {
    type Target = WorkerInstance;

    fn deref(&self) -> &WorkerInstance {
        self.instance
            .as_ref()
            .expect("lease holds its instance until dropped")
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            instance.last_used = Instant::now();
            self.home.idle().push(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::atomic::AtomicUsize};

    use fluxgate_core::{GenerationRequest, LoadedModel, ModelLike, SafetyChecker};
    use image::DynamicImage;

    use super::*;

    struct Blank;

    impl ModelLike for Blank {
        fn run(&mut self, _request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
            Ok(DynamicImage::new_rgb8(1, 1))
        }
    }

    impl SafetyChecker for Blank {
        fn is_unsafe(&mut self, _image: &DynamicImage) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        activations: AtomicUsize,
        compiled: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl WorkerFactory for CountingFactory {
        fn activate(&self, compile: bool) -> anyhow::Result<LoadedModel> {
            if self.fail {
                anyhow::bail!("no accelerator");
            }
            std::thread::sleep(self.delay);
            self.activations.fetch_add(1, Ordering::SeqCst);
            if compile {
                self.compiled.fetch_add(1, Ordering::SeqCst);
            }
            Ok(LoadedModel {
                pipeline: Box::new(Blank),
                safety: Box::new(Blank),
            })
        }
    }

    fn pool(factory: Arc<CountingFactory>, max_instances: usize) -> WorkerPool {
        WorkerPool::new(
            factory,
            PoolConfig {
                max_instances: NonZeroUsize::new(max_instances).unwrap(),
                idle_timeout: Duration::from_secs(600),
            },
        )
    }

    #[tokio::test]
    async fn warm_instance_is_reused() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(Arc::clone(&factory), 1);

        let first = pool.acquire(false).await.unwrap().id();
        let second = pool.acquire(false).await.unwrap().id();

        assert_eq!(first, second);
        assert_eq!(factory.activations.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(false), 1);
    }

    #[tokio::test]
    async fn compile_flags_have_separate_instances() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(Arc::clone(&factory), 1);

        let plain = pool.acquire(false).await.unwrap();
        let compiled = pool.acquire(true).await.unwrap();

        assert!(!plain.compile());
        assert!(compiled.compile());
        assert_ne!(plain.id(), compiled.id());
        assert_eq!(factory.compiled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_activation_adds_no_instance() {
        let factory = Arc::new(CountingFactory {
            fail: true,
            ..CountingFactory::default()
        });
        let pool = pool(factory, 1);

        let error = pool.acquire(false).await.err().unwrap();
        assert!(matches!(error, ServerError::Activation(_)));
        assert_eq!(pool.idle_count(false), 0);

        // The permit was released, so a retry is not blocked.
        assert!(pool.acquire(false).await.is_err());
    }

    #[tokio::test]
    async fn preload_parks_an_idle_instance() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(Arc::clone(&factory), 1);

        pool.preload(true).await.unwrap();
        assert_eq!(pool.idle_count(true), 1);
        assert_eq!(pool.idle_count(false), 0);
        assert_eq!(factory.compiled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_instances_are_evicted_after_timeout() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(Arc::clone(&factory), 1);
        pool.preload(false).await.unwrap();

        let now = Instant::now();
        assert_eq!(pool.evict_idle(now), 0);
        assert_eq!(pool.evict_idle(now + Duration::from_secs(601)), 1);
        assert_eq!(pool.idle_count(false), 0);

        pool.acquire(false).await.unwrap();
        assert_eq!(factory.activations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_activation_keeps_its_permit_and_parks_the_instance() {
        let factory = Arc::new(CountingFactory {
            delay: Duration::from_millis(200),
            ..CountingFactory::default()
        });
        let pool = pool(Arc::clone(&factory), 1);

        let abandoned = tokio::time::timeout(Duration::from_millis(20), pool.acquire(false)).await;
        assert!(abandoned.is_err());
        assert_eq!(factory.activations.load(Ordering::SeqCst), 0);

        // Waits for the first activation's permit, then reuses its instance.
        let lease = pool.acquire(false).await.unwrap();
        assert_eq!(lease.id(), 0);
        assert_eq!(factory.activations.load(Ordering::SeqCst), 1);
        drop(lease);
        assert_eq!(pool.idle_count(false), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_share_an_instance() {
        let factory = Arc::new(CountingFactory::default());
        let pool = Arc::new(pool(Arc::clone(&factory), 2));
        let held = Arc::new(Mutex::new(HashSet::new()));

        let tasks = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                tokio::spawn(async move {
                    let lease = pool.acquire(false).await.unwrap();
                    assert!(held.lock().unwrap().insert(lease.id()), "instance leased twice");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    held.lock().unwrap().remove(&lease.id());
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(factory.activations.load(Ordering::SeqCst) <= 2);
        assert!(pool.idle_count(false) <= 2);
    }
}
