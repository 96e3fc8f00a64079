//! Bridge orchestrator.
//!
//! Owns the retrieval and retry queues, the API client pool, both worker
//! pools and the background loops that keep them sized:
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────┐
//! │ ChangeFeed │──▶│ Feed pump    │──▶│ Retrieval    │──▶│ Workers │──┐
//! └────────────┘   │ (filter)     │   │ queue        │   └─────────┘  │
//!                  └──────────────┘   └──────────────┘        │       ▼
//!                                     ┌──────────────┐   ┌─────────┐ ┌─────────┐
//!                                     │ Retry queue  │◀──│ Retry   │ │ Storage │
//!                                     │ (delayed)    │──▶│ workers │ └─────────┘
//!                                     └──────────────┘   └─────────┘
//! ```
//!
//! The feed pump is the only task whose failure stops the bridge: if the
//! store cannot answer a filter query there is nothing useful left to do.
//! The pool-size controller, index-lag watcher, performance watcher and
//! stats reporter log their own failures and keep ticking.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use edge_core::{Clock, QueueEntry, ResourceKind};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{BridgeError, ErrorCategory, Result},
    feed::{ChangeFeed, FeedItem},
    pool::{ApiClientPool, PerformanceReport, PoolConfig},
    queue::{Capacity, ItemSource, QueueFull, ResourceQueue, RetryQueue},
    retry::{RetryPolicy, RetryScheduler},
    stats::{BridgeStats, RuntimeStats},
    storage::StorageAdapter,
    worker::{WorkerConfig, WorkerContext},
    worker_pool::WorkerPool,
};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Replicated resource collection.
    pub resource: ResourceKind,
    /// Floor of the main worker pool.
    pub workers_min: usize,
    /// Ceiling of the main worker pool.
    pub workers_max: usize,
    /// Floor of the retry worker pool.
    pub retry_workers_min: usize,
    /// Ceiling of the retry worker pool.
    pub retry_workers_max: usize,
    /// Fill percentage above which a worker is added.
    pub workers_inc_threshold: u32,
    /// Fill percentage below which a worker is retired.
    pub workers_dec_threshold: u32,
    /// Retrieval queue capacity.
    pub resource_items_queue_size: Capacity,
    /// Retry queue capacity.
    pub retry_resource_items_queue_size: Capacity,
    /// Feed items per filter query.
    pub bulk_query_limit: usize,
    /// Maximum age of a feed batch before it is filtered.
    pub bulk_query_interval: Duration,
    /// Pause after the feed runs dry.
    pub feed_up_wait_sleep: Duration,
    /// Pause after a feed failure.
    pub feed_error_sleep: Duration,
    /// How long one push waits for room in the retrieval queue.
    pub queue_timeout: Duration,
    /// Pool-size controller period.
    pub queues_controller_timeout: Duration,
    /// Stats reporter period.
    pub watch_interval: Duration,
    /// Performance watcher period.
    pub performance_watch_interval: Duration,
    /// Index-lag watcher period.
    pub index_watch_interval: Duration,
    /// How long request duration samples are kept.
    pub request_duration_retention: Duration,
    /// Multiple of the population mean above which a client is degraded.
    pub degraded_mean_multiplier: f64,
    /// Maximum wait for tasks to drain at shutdown.
    pub shutdown_timeout: Duration,
    /// Settings handed to every worker.
    pub worker: WorkerConfig,
    /// Client pool settings.
    pub pool: PoolConfig,
    /// Retry policy.
    pub retry: RetryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            resource: ResourceKind::Tenders,
            workers_min: 1,
            workers_max: 3,
            retry_workers_min: 1,
            retry_workers_max: 2,
            workers_inc_threshold: 75,
            workers_dec_threshold: 35,
            resource_items_queue_size: Capacity::Bounded(10_000),
            retry_resource_items_queue_size: Capacity::Unbounded,
            bulk_query_limit: 1000,
            bulk_query_interval: Duration::from_secs(5),
            feed_up_wait_sleep: Duration::from_secs(30),
            feed_error_sleep: Duration::from_secs(5),
            queue_timeout: Duration::from_secs(3),
            queues_controller_timeout: Duration::from_secs(60),
            watch_interval: Duration::from_secs(10),
            performance_watch_interval: Duration::from_secs(60),
            index_watch_interval: Duration::from_secs(60),
            request_duration_retention: Duration::from_secs(300),
            degraded_mean_multiplier: 1.5,
            shutdown_timeout: Duration::from_secs(30),
            worker: WorkerConfig::default(),
            pool: PoolConfig {
                client: crate::client::ClientConfig::default(),
                bridge_id: "edge".to_string(),
                max_clients: 5,
            },
            retry: RetryPolicy::default(),
        }
    }
}

/// Queue fill as a percentage of `capacity`, measured against `fallback`
/// when the queue is unbounded.
pub fn fill_percent(depth: usize, capacity: Capacity, fallback: usize) -> f64 {
    let reference = capacity.limit().unwrap_or(fallback).max(1);
    depth as f64 * 100.0 / reference as f64
}

struct BridgeCore {
    config: BridgeConfig,
    storage: Arc<dyn StorageAdapter>,
    feed: Arc<dyn ChangeFeed>,
    clients: Arc<ApiClientPool>,
    queue: Arc<ResourceQueue>,
    retry_queue: Arc<RetryQueue>,
    workers: Mutex<WorkerPool>,
    retry_workers: Mutex<WorkerPool>,
    stats: Arc<RwLock<RuntimeStats>>,
    throttled: AtomicBool,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

/// Bridge orchestrator and owner of every background task.
pub struct BridgeEngine {
    core: Arc<BridgeCore>,
    pump: Option<JoinHandle<Result<()>>>,
    loops: Vec<(&'static str, JoinHandle<()>)>,
}

impl BridgeEngine {
    /// Wires queues, pools and workers together. Only the retry scheduler
    /// runs before [`start`](Self::start).
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        config: BridgeConfig,
        storage: Arc<dyn StorageAdapter>,
        feed: Arc<dyn ChangeFeed>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let stats = Arc::new(RwLock::new(RuntimeStats::default()));
        let clients =
            Arc::new(ApiClientPool::new(config.pool.clone(), clock.clone(), stats.clone()));
        let queue = Arc::new(ResourceQueue::new(config.resource_items_queue_size, clock.clone()));
        let retry_queue =
            Arc::new(RetryQueue::new(config.retry_resource_items_queue_size, clock.clone()));
        let retry = Arc::new(RetryScheduler::new(
            config.retry.clone(),
            retry_queue.clone(),
            stats.clone(),
            config.resource,
        ));

        let context = WorkerContext {
            config: config.worker.clone(),
            storage: storage.clone(),
            clients: clients.clone(),
            retry,
            stats: stats.clone(),
            clock: clock.clone(),
        };
        let main_source: Arc<dyn ItemSource> = queue.clone();
        let retry_source: Arc<dyn ItemSource> = retry_queue.clone();
        let workers =
            WorkerPool::new("main", context.clone(), main_source, cancellation_token.clone());
        let retry_workers =
            WorkerPool::new("retry", context, retry_source, cancellation_token.clone());

        let core = BridgeCore {
            config,
            storage,
            feed,
            clients,
            queue,
            retry_queue,
            workers: Mutex::new(workers),
            retry_workers: Mutex::new(retry_workers),
            stats,
            throttled: AtomicBool::new(false),
            clock,
            cancellation_token,
        };

        Self { core: Arc::new(core), pump: None, loops: Vec::new() }
    }

    /// Fills the client pool to the worker floor, spawns the floor of both
    /// worker pools and starts the feed pump and control loops.
    ///
    /// Client creation failures are logged and counted; the controller keeps
    /// topping the pool up on later ticks.
    pub async fn start(&mut self) -> Result<()> {
        let core = self.core.clone();
        let config = &core.config;
        info!(
            message_id = "edge_bridge_start_bridge",
            resource = %config.resource,
            workers_min = config.workers_min,
            retry_workers_min = config.retry_workers_min,
            "starting edge bridge"
        );

        let created = core.clients.top_up(config.workers_min).await;
        info!(clients = created, "api client pool filled");

        core.workers.lock().await.grow_to(config.workers_min);
        core.retry_workers.lock().await.grow_to(config.retry_workers_min);

        let pump_core = core.clone();
        self.pump = Some(tokio::spawn(async move { pump_core.run_feed_pump().await }));

        self.spawn_loop("queues_controller", config.queues_controller_timeout, |core| async move {
            core.adjust_workers().await;
        });
        self.spawn_loop("index_watcher", config.index_watch_interval, |core| async move {
            if let Err(e) = core.check_index_lag().await {
                warn!(
                    message_id = e.message_id(),
                    code = e.code(),
                    error = %e,
                    "failed to read index progress"
                );
            }
        });
        self.spawn_loop(
            "performance_watcher",
            config.performance_watch_interval,
            |core| async move {
                core.watch_performance().await;
            },
        );
        self.spawn_loop("stats_reporter", config.watch_interval, |core| async move {
            core.report_stats().await;
        });

        info!(message_id = "edge_bridge__data_sync", "data sync started");
        Ok(())
    }

    fn spawn_loop<F, Fut>(&mut self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn(Arc<BridgeCore>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            debug!(task = name, period_seconds = period.as_secs_f64(), "control loop starting");
            loop {
                tokio::select! {
                    () = core.clock.sleep(period) => {},
                    () = core.cancellation_token.cancelled() => break,
                }
                tick(core.clone()).await;
            }
            debug!(task = name, "control loop stopped");
        });
        self.loops.push((name, handle));
    }

    /// Waits until the feed pump stops.
    ///
    /// Resolves only after cancellation or a fatal pump failure; pends
    /// forever if the engine was never started.
    ///
    /// # Errors
    ///
    /// Returns the pump's fatal error, or `TaskPanic` if it panicked.
    pub async fn wait_for_failure(&mut self) -> Result<()> {
        let Some(pump) = self.pump.as_mut() else {
            return std::future::pending().await;
        };
        let result = pump.await;
        self.pump = None;
        match result {
            Ok(result) => result,
            Err(join_error) => Err(BridgeError::task_panic("feed_pump", join_error.to_string())),
        }
    }

    /// Runs one pool-size controller tick.
    pub async fn adjust_workers(&self) {
        self.core.adjust_workers().await;
    }

    /// Runs one index-lag watcher tick and returns the reported progress.
    ///
    /// # Errors
    ///
    /// Returns the storage error if progress could not be read.
    pub async fn check_index_lag(&self) -> Result<f64> {
        self.core.check_index_lag().await
    }

    /// Runs one performance watcher tick.
    pub async fn watch_performance(&self) -> PerformanceReport {
        self.core.watch_performance().await
    }

    /// Builds a stats snapshot, optionally zeroing the counters.
    pub async fn collect_stats(&self, reset: bool) -> BridgeStats {
        self.core.collect_stats(reset).await
    }

    /// True while index lag is holding the worker pool at its floor.
    pub fn is_throttled(&self) -> bool {
        self.core.throttled.load(Ordering::Acquire)
    }

    /// Active main workers.
    pub async fn workers_len(&self) -> usize {
        self.core.workers.lock().await.len()
    }

    /// Active retry workers.
    pub async fn retry_workers_len(&self) -> usize {
        self.core.retry_workers.lock().await.len()
    }

    /// Retrieval queue.
    pub fn queue(&self) -> &Arc<ResourceQueue> {
        &self.core.queue
    }

    /// Retry queue.
    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.core.retry_queue
    }

    /// API client pool.
    pub fn clients(&self) -> &Arc<ApiClientPool> {
        &self.core.clients
    }

    /// Token that stops every task when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.cancellation_token.clone()
    }

    /// Cancels every task and waits up to the shutdown timeout for workers
    /// to flush and exit.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if a worker pool did not drain in time.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.core.config.shutdown_timeout;
        info!(timeout_seconds = timeout.as_secs(), "initiating bridge shutdown");
        self.core.cancellation_token.cancel();

        if let Some(pump) = self.pump.take() {
            match tokio::time::timeout(timeout, pump).await {
                Ok(Ok(Err(e))) => {
                    warn!(message_id = e.message_id(), error = %e, "feed pump ended with error");
                },
                Ok(Err(join_error)) => {
                    error!(error = %join_error, "feed pump panicked");
                },
                Err(_elapsed) => warn!("feed pump did not stop in time"),
                Ok(Ok(Ok(()))) => {},
            }
        }

        for (name, handle) in self.loops.drain(..) {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(task = name, "control loop did not stop in time");
            }
        }

        let main = self.core.workers.lock().await.shutdown_graceful(timeout).await;
        let retry = self.core.retry_workers.lock().await.shutdown_graceful(timeout).await;

        let remaining = self.core.queue.len() + self.core.retry_queue.len();
        info!(unprocessed_references = remaining, "bridge shutdown completed");
        main.and(retry)
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        if !self.core.cancellation_token.is_cancelled() {
            warn!("bridge engine dropped without shutdown, cancelling tasks");
            self.core.cancellation_token.cancel();
        }
    }
}

impl BridgeCore {
    async fn run_feed_pump(self: Arc<Self>) -> Result<()> {
        let config = &self.config;
        info!(resource = %config.resource, "feed pump starting");

        let mut batch: Vec<FeedItem> = Vec::new();
        let mut batch_started = self.clock.now();

        while !self.cancellation_token.is_cancelled() {
            let next = tokio::select! {
                next = self.feed.next_batch() => next,
                () = self.cancellation_token.cancelled() => break,
            };

            let pause = match next {
                Ok(items) if items.is_empty() => {
                    debug!(
                        forward = ?self.feed.forward_info().status,
                        backward = ?self.feed.backward_info().status,
                        "feed has no new items"
                    );
                    Some(config.feed_up_wait_sleep)
                },
                Ok(items) => {
                    if batch.is_empty() {
                        batch_started = self.clock.now();
                    }
                    batch.extend(items);
                    None
                },
                Err(e) => {
                    warn!(
                        message_id = e.message_id(),
                        code = e.code(),
                        category = %ErrorCategory::from(&e),
                        error = %e,
                        "failed to read change feed"
                    );
                    Some(config.feed_error_sleep)
                },
            };

            let age = self.clock.now().saturating_duration_since(batch_started);
            let due = batch.len() >= config.bulk_query_limit
                || age >= config.bulk_query_interval
                || pause.is_some();
            if !batch.is_empty() && due {
                if let Err(e) = self.enqueue_batch(std::mem::take(&mut batch)).await {
                    error!(
                        severity = "critical",
                        message_id = e.message_id(),
                        code = e.code(),
                        error = %e,
                        "storage filter failed, stopping bridge"
                    );
                    self.cancellation_token.cancel();
                    return Err(e);
                }
            }

            if let Some(pause) = pause {
                tokio::select! {
                    () = self.clock.sleep(pause) => {},
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!("feed pump stopped");
        Ok(())
    }

    /// Filters a feed batch against the store and enqueues what is missing
    /// or stale locally.
    async fn enqueue_batch(&self, batch: Vec<FeedItem>) -> Result<()> {
        let ids: Vec<String> = batch.iter().map(|item| item.reference.id.clone()).collect();
        let local = self.storage.filter(ids).await?;

        let mut enqueued = 0usize;
        let mut skipped = 0u64;
        for item in batch {
            let stale = match (local.get(&item.reference.id), item.reference.date_modified) {
                (Some(local_date), Some(remote_date)) => *local_date < remote_date,
                _ => true,
            };
            if !stale {
                skipped += 1;
                continue;
            }

            let entry = QueueEntry::new(item.reference, self.config.retry.initial_metadata());
            if !self.enqueue(entry).await {
                break;
            }
            enqueued += 1;
        }

        if skipped > 0 {
            self.stats.write().await.skipped += skipped;
        }
        debug!(enqueued, skipped, queue_depth = self.queue.len(), "filtered feed batch");
        Ok(())
    }

    /// Pushes with backpressure. Returns false once the bridge is cancelled.
    async fn enqueue(&self, mut entry: QueueEntry) -> bool {
        loop {
            match self.queue.push(entry, self.config.queue_timeout).await {
                Ok(()) => {
                    self.stats.write().await.add_to_resource_items_queue += 1;
                    return true;
                },
                Err(QueueFull(returned)) => {
                    if self.cancellation_token.is_cancelled() {
                        return false;
                    }
                    debug!(queue_depth = self.queue.len(), "retrieval queue full, waiting");
                    entry = returned;
                },
            }
        }
    }

    async fn adjust_workers(&self) {
        let config = &self.config;
        let throttled = self.throttled.load(Ordering::Acquire);
        let main_reference =
            config.resource_items_queue_size.limit().unwrap_or(config.bulk_query_limit);

        let fill = fill_percent(self.queue.len(), config.resource_items_queue_size, main_reference);
        let grow = fill > f64::from(config.workers_inc_threshold)
            && !throttled
            && self.workers.lock().await.len() < config.workers_max;
        if grow {
            self.clients.top_up(self.clients.len() + 1).await;
        }
        let workers = {
            let mut workers = self.workers.lock().await;
            workers.reap();
            if grow && workers.len() < config.workers_max {
                workers.spawn_worker();
                info!(fill_percent = fill, workers = workers.len(), "added main queue worker");
            } else if fill < f64::from(config.workers_dec_threshold)
                && workers.len() > config.workers_min
            {
                workers.retire_one();
                info!(fill_percent = fill, workers = workers.len(), "retired main queue worker");
            }
            if workers.len() < config.workers_min {
                workers.grow_to(config.workers_min);
            }
            workers.len()
        };

        let retry_fill = fill_percent(
            self.retry_queue.len(),
            config.retry_resource_items_queue_size,
            main_reference,
        );
        let retry_grow = retry_fill > f64::from(config.workers_inc_threshold)
            && !throttled
            && self.retry_workers.lock().await.len() < config.retry_workers_max;
        if retry_grow {
            self.clients.top_up(self.clients.len() + 1).await;
        }
        let retry_workers = {
            let mut retry_workers = self.retry_workers.lock().await;
            retry_workers.reap();
            if retry_grow && retry_workers.len() < config.retry_workers_max {
                retry_workers.spawn_worker();
                info!(
                    fill_percent = retry_fill,
                    workers = retry_workers.len(),
                    "added retry queue worker"
                );
            } else if retry_fill < f64::from(config.workers_dec_threshold)
                && retry_workers.len() > config.retry_workers_min
            {
                retry_workers.retire_one();
                info!(
                    fill_percent = retry_fill,
                    workers = retry_workers.len(),
                    "retired retry queue worker"
                );
            }
            if retry_workers.len() < config.retry_workers_min {
                retry_workers.grow_to(config.retry_workers_min);
            }
            retry_workers.len()
        };

        let clients = self.clients.len();
        if clients < config.workers_min {
            self.clients.top_up(config.workers_min).await;
        }

        info!(
            resource_items_queue_fill = fill,
            retry_resource_items_queue_fill = retry_fill,
            workers,
            retry_workers,
            clients = self.clients.len(),
            throttled,
            "queues controller tick"
        );
    }

    async fn check_index_lag(&self) -> Result<f64> {
        let progress = self.storage.index_progress().await?;

        if progress < 100.0 {
            let was_throttled = self.throttled.swap(true, Ordering::AcqRel);
            let retired = self.workers.lock().await.shrink_to(self.config.workers_min);
            let retry_retired =
                self.retry_workers.lock().await.shrink_to(self.config.retry_workers_min);
            if !was_throttled || retired > 0 || retry_retired > 0 {
                warn!(
                    index_progress = progress,
                    retired,
                    retry_retired,
                    workers_min = self.config.workers_min,
                    retry_workers_min = self.config.retry_workers_min,
                    "index rebuild in progress, holding workers at floor"
                );
            }
        } else if self.throttled.swap(false, Ordering::AcqRel) {
            info!("index caught up, worker growth resumed");
        }

        Ok(progress)
    }

    async fn watch_performance(&self) -> PerformanceReport {
        let report = self.clients.evaluate_health(
            self.config.request_duration_retention,
            self.config.degraded_mean_multiplier,
        );

        let mut replaced = 0u64;
        for id in &report.degraded {
            match self.clients.create_client().await {
                Ok(new_id) => {
                    replaced += 1;
                    info!(degraded_client = %id, client_id = %new_id, "replaced degraded api client");
                },
                Err(e) => {
                    warn!(degraded_client = %id, error = %e, "failed to replace degraded api client");
                },
            }
        }
        if replaced > 0 {
            self.stats.write().await.replaced_clients += replaced;
        }

        info!(
            mean = report.mean,
            std_dev = report.std_dev,
            degraded = report.degraded.len(),
            clients = self.clients.len(),
            "evaluated api client performance"
        );
        report
    }

    async fn collect_stats(&self, reset: bool) -> BridgeStats {
        let counters = {
            let mut stats = self.stats.write().await;
            let counters = stats.clone();
            if reset {
                stats.reset();
            }
            counters
        };

        let ready = self.retry_queue.ready_len();
        BridgeStats {
            time: self.clock.now_utc(),
            resource: self.config.resource,
            resource_items_queue_size: self.queue.len(),
            retry_resource_items_queue_size: ready,
            retry_pending_items: self.retry_queue.len().saturating_sub(ready),
            workers_count: self.workers.lock().await.len(),
            retry_workers_count: self.retry_workers.lock().await.len(),
            api_clients_count: self.clients.len(),
            free_api_clients: self.clients.idle_len(),
            request_durations: self.clients.request_duration_summary(),
            index_throttled: self.throttled.load(Ordering::Acquire),
            counters,
            forward_info: self.feed.forward_info(),
            backward_info: self.feed.backward_info(),
        }
    }

    async fn report_stats(&self) {
        let stats = self.collect_stats(true).await;
        match serde_json::to_string(&stats) {
            Ok(json) => info!(message_id = "edge_bridge_stats", stats = %json, "bridge stats"),
            Err(e) => warn!(error = %e, "failed to serialize bridge stats"),
        }
    }
}
