//! Pool of SFU worker processes and the selection policy for placing new
//! routers on them.

use crate::events::EventBus;
use crate::registry::Registry;
use crate::worker::{Worker, WorkerSettings};
use async_executor::Executor;
use futures_lite::future;
use log::*;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Pool sizing and reaping knobs.
#[derive(Debug, Clone)]
pub struct WorkerPoolSettings {
    /// Upper bound of concurrently running workers. Default 4.
    pub max_workers: usize,
    /// A worker whose load score stayed at zero for this long is shut
    /// down. Default 60 s.
    pub idle_timeout: Duration,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

struct Inner {
    executor: Arc<Executor<'static>>,
    stop_sender: Mutex<Option<async_oneshot::Sender<()>>>,
    worker_binary: PathBuf,
    pool_settings: WorkerPoolSettings,
    workers: Mutex<Vec<Worker>>,
    registry: Registry,
    event_bus: EventBus,
    worker_dead_handlers: Mutex<Vec<event_listener_primitives::HandlerId>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(mut stop_sender) = self.stop_sender.lock().take() {
            let _ = stop_sender.send(());
        }
    }
}

/// Owner of the worker pool, the resource registry and the event bus;
/// constructed once at startup and passed to every component.
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    pub fn new(worker_binary: PathBuf) -> Self {
        Self::with_pool_settings(worker_binary, WorkerPoolSettings::default())
    }

    pub fn with_pool_settings(worker_binary: PathBuf, pool_settings: WorkerPoolSettings) -> Self {
        let executor = Arc::new(Executor::new());
        let (stop_sender, stop_receiver) = async_oneshot::oneshot::<()>();
        {
            let executor = Arc::clone(&executor);
            thread::spawn(move || {
                let _ = future::block_on(executor.run(stop_receiver));
            });
        }

        let event_bus = EventBus::new(&executor);

        Self {
            inner: Arc::new(Inner {
                executor,
                stop_sender: Mutex::new(Some(stop_sender)),
                worker_binary,
                pool_settings,
                workers: Mutex::new(Vec::new()),
                registry: Registry::new(),
                event_bus,
                worker_dead_handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub(crate) fn executor(&self) -> &Arc<Executor<'static>> {
        &self.inner.executor
    }

    /// Spawns a worker and adds it to the pool.
    pub async fn create_worker(&self, worker_settings: WorkerSettings) -> io::Result<Worker> {
        debug!("create_worker()");

        let worker = Worker::new(
            Arc::clone(&self.inner.executor),
            self.inner.worker_binary.clone(),
            worker_settings,
            self.inner.registry.clone(),
            self.inner.event_bus.clone(),
        )
        .await?;

        {
            let mut workers = self.inner.workers.lock();
            workers.push(worker.clone());
        }
        {
            let inner_weak = Arc::downgrade(&self.inner);
            let worker_id = worker.id();
            let handler_id = worker.on_dead(move |_exit_status| {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.workers.lock().retain(|worker| worker.id() != worker_id);
                }
            });
            self.inner.worker_dead_handlers.lock().push(handler_id);
        }

        Ok(worker)
    }

    /// Selects the worker a new router should land on.
    ///
    /// A new worker is spawned when the pool is empty, or when the least
    /// loaded worker is busy and the pool has headroom; otherwise the
    /// least loaded worker is returned. Idle workers that sat at zero load
    /// past the idle timeout are shut down on the way.
    pub async fn acquire_worker(
        &self,
        worker_settings: WorkerSettings,
    ) -> io::Result<Worker> {
        let best = {
            let mut workers = self.inner.workers.lock();
            workers.retain(|worker| !worker.closed());
            let count = workers.len();
            let best = workers
                .iter()
                .min_by_key(|worker| worker.load_score())
                .cloned();
            match best {
                Some(best)
                    if !(count < self.inner.pool_settings.max_workers
                        && best.load_score() > 0) =>
                {
                    Some(best)
                }
                _ => None,
            }
        };

        let selected = match best {
            Some(best) => best,
            None => self.create_worker(worker_settings).await?,
        };

        self.reap_idle_workers(selected.id());

        Ok(selected)
    }

    fn reap_idle_workers(&self, keep_id: crate::worker::WorkerId) {
        let now = Instant::now();
        let idle_timeout = self.inner.pool_settings.idle_timeout;
        let idle: Vec<Worker> = {
            let workers = self.inner.workers.lock();
            workers
                .iter()
                .filter(|worker| {
                    worker.id() != keep_id
                        && worker.load_score() < 1
                        && worker
                            .load_score_zero_time()
                            .map(|zero_time| now.duration_since(zero_time) >= idle_timeout)
                            .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for worker in idle {
            info!("shutting down idle worker [pid:{}]", worker.pid());
            worker.kill();
            self.inner
                .workers
                .lock()
                .retain(|pooled| pooled.id() != worker.id());
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Kills every worker in parallel; the cooperative global shutdown.
    pub fn shutdown(&self) {
        let workers: Vec<Worker> = {
            let mut workers = self.inner.workers.lock();
            workers.drain(..).collect()
        };
        for worker in workers {
            worker.kill();
        }
    }
}
