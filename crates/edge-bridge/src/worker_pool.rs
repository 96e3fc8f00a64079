//! Resizable set of supervised worker tasks.
//!
//! Every worker runs under a child of the pool's cancellation token, so the
//! pool can retire a single worker without touching the rest, and cancelling
//! the parent stops them all.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{BridgeError, Result},
    queue::ItemSource,
    worker::{ResourceItemWorker, WorkerContext},
};

struct WorkerSlot {
    id: usize,
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Worker tasks consuming one queue.
pub struct WorkerPool {
    name: &'static str,
    context: WorkerContext,
    source: Arc<dyn ItemSource>,
    cancellation_token: CancellationToken,
    workers: Vec<WorkerSlot>,
    retiring: Vec<WorkerSlot>,
    next_id: usize,
}

impl WorkerPool {
    /// Creates an empty pool whose workers pull from `source`.
    pub fn new(
        name: &'static str,
        context: WorkerContext,
        source: Arc<dyn ItemSource>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            name,
            context,
            source,
            cancellation_token,
            workers: Vec::new(),
            retiring: Vec::new(),
            next_id: 0,
        }
    }

    /// Pool name used in log lines.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Active workers, excluding ones that are draining after retirement.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if no worker is active.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers retired but not finished yet.
    pub fn retiring_len(&self) -> usize {
        self.retiring.len()
    }

    /// Spawns one worker and returns its id.
    pub fn spawn_worker(&mut self) -> usize {
        let worker_id = self.next_id;
        self.next_id += 1;

        let token = self.cancellation_token.child_token();
        let worker =
            ResourceItemWorker::new(worker_id, self.context.clone(), self.source.clone(), token.clone());
        let pool = self.name;

        let handle = tokio::spawn(async move {
            let result = worker.run().await;
            if let Err(ref error) = result {
                error!(pool, worker_id, error = %error, "worker terminated with error");
            }
            result
        });

        self.workers.push(WorkerSlot { id: worker_id, token, handle });
        info!(pool, worker_id, workers = self.workers.len(), "spawned worker");
        worker_id
    }

    /// Spawns workers until `target` are active.
    pub fn grow_to(&mut self, target: usize) {
        while self.workers.len() < target {
            self.spawn_worker();
        }
    }

    /// Signals the most recently spawned worker to drain and stop.
    ///
    /// Returns false if the pool is empty.
    pub fn retire_one(&mut self) -> bool {
        let Some(slot) = self.workers.pop() else {
            return false;
        };
        slot.token.cancel();
        info!(pool = self.name, worker_id = slot.id, workers = self.workers.len(), "retiring worker");
        self.retiring.push(slot);
        true
    }

    /// Retires workers until at most `target` are active.
    pub fn shrink_to(&mut self, target: usize) -> usize {
        let mut retired = 0;
        while self.workers.len() > target && self.retire_one() {
            retired += 1;
        }
        retired
    }

    /// Forgets finished tasks; returns how many active workers had exited on
    /// their own.
    pub fn reap(&mut self) -> usize {
        self.retiring.retain(|slot| !slot.handle.is_finished());

        let before = self.workers.len();
        self.workers.retain(|slot| {
            let finished = slot.handle.is_finished();
            if finished {
                warn!(pool = self.name, worker_id = slot.id, "worker exited unexpectedly");
            }
            !finished
        });
        before - self.workers.len()
    }

    /// Cancels every worker and waits up to `timeout` for them to drain.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers are still running at the deadline.
    pub async fn shutdown_graceful(&mut self, timeout: Duration) -> Result<()> {
        let mut slots = std::mem::take(&mut self.workers);
        slots.append(&mut self.retiring);
        info!(
            pool = self.name,
            worker_count = slots.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        for slot in &slots {
            slot.token.cancel();
        }

        let pool = self.name;
        let shutdown = async move {
            let mut failures = 0usize;
            for slot in slots {
                match slot.handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(pool, worker_id = slot.id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        let panic = BridgeError::WorkerPanic {
                            worker_id: slot.id,
                            error: join_error.to_string(),
                        };
                        error!(
                            pool,
                            worker_id = slot.id,
                            message_id = panic.message_id(),
                            error = %panic,
                            "worker task panicked during shutdown"
                        );
                        failures += 1;
                    },
                }
            }
            failures
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(failures) => {
                if failures > 0 {
                    warn!(pool, failures, "some workers panicked during shutdown");
                }
                info!(pool, "worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    pool,
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(BridgeError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.workers.iter().filter(|slot| !slot.handle.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(pool = self.name, active_workers = active, "worker pool dropped with active workers, cancelling");
            for slot in &self.workers {
                slot.token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use edge_core::{Clock, RealClock, ResourceKind};
    use tokio::sync::RwLock;

    use super::*;
    use crate::{
        client::ClientConfig,
        pool::{ApiClientPool, PoolConfig},
        queue::{Capacity, ResourceQueue, RetryQueue},
        retry::{RetryPolicy, RetryScheduler},
        stats::RuntimeStats,
        storage::mock::MockStorage,
        worker::WorkerConfig,
    };

    fn pool() -> WorkerPool {
        let clock: Arc<dyn Clock> = Arc::new(RealClock);
        let stats = Arc::new(RwLock::new(RuntimeStats::default()));
        let clients = Arc::new(ApiClientPool::new(
            PoolConfig { client: ClientConfig::default(), bridge_id: "test".into(), max_clients: 1 },
            clock.clone(),
            stats.clone(),
        ));
        let retry_queue = Arc::new(RetryQueue::new(Capacity::Unbounded, clock.clone()));
        let retry = Arc::new(RetryScheduler::new(
            RetryPolicy::default(),
            retry_queue,
            stats.clone(),
            ResourceKind::Tenders,
        ));
        let context = WorkerContext {
            config: WorkerConfig {
                worker_sleep: Duration::from_millis(10),
                queue_timeout: Duration::from_millis(10),
                ..Default::default()
            },
            storage: Arc::new(MockStorage::new()),
            clients,
            retry,
            stats,
            clock: clock.clone(),
        };
        let source = Arc::new(ResourceQueue::new(Capacity::Bounded(10), clock));
        WorkerPool::new("main", context, source, CancellationToken::new())
    }

    #[tokio::test]
    async fn retired_workers_drain_and_are_reaped() {
        let mut pool = pool();
        pool.grow_to(3);
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.shrink_to(1), 2);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.retiring_len(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.reap(), 0);
        assert_eq!(pool.retiring_len(), 0);

        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn empty_pool_cannot_retire() {
        let mut pool = pool();
        assert!(!pool.retire_one());
        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
    }
}
