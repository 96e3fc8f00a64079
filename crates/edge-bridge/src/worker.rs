//! Resource item worker.
//!
//! Each worker repeatedly checks out an API client, takes one reference from
//! its queue, decides whether the local copy needs refreshing, fetches the
//! document and buffers it in a private [`Bulk`]. The bulk is flushed to
//! storage on size, age or shutdown. Every per-item failure is routed through
//! the [`RetryScheduler`]; nothing a single item does can stop the worker.

use std::{collections::HashMap, sync::Arc, time::Duration};

use edge_core::{Clock, QueueEntry, ResourceDocument, ResourceItemReference, ResourceKind, RetryMetadata};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bulk::Bulk,
    error::{BridgeError, Result},
    pool::{ApiClientHandle, ApiClientPool, RateLimitAction},
    queue::ItemSource,
    retry::{FailureKind, RetryScheduler},
    stats::RuntimeStats,
    storage::StorageAdapter,
};

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Replicated resource collection.
    pub resource: ResourceKind,
    /// Pause after failing to get an API client.
    pub worker_sleep: Duration,
    /// Wait for a client or a queue entry.
    pub queue_timeout: Duration,
    /// Documents per bulk write.
    pub bulk_save_limit: usize,
    /// Maximum age of a non-empty bulk.
    pub bulk_save_interval: Duration,
    /// Client interval growth per 429.
    pub client_inc_step_timeout: Duration,
    /// Client interval shrink per successful fetch.
    pub client_dec_step_timeout: Duration,
    /// Interval past which a 429 renews the session instead.
    pub drop_threshold_client_cookies: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            resource: ResourceKind::Tenders,
            worker_sleep: Duration::from_secs(5),
            queue_timeout: Duration::from_secs(3),
            bulk_save_limit: 1000,
            bulk_save_interval: Duration::from_secs(5),
            client_inc_step_timeout: Duration::from_millis(100),
            client_dec_step_timeout: Duration::from_millis(20),
            drop_threshold_client_cookies: Duration::from_secs(2),
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    /// Worker settings.
    pub config: WorkerConfig,
    /// Local store.
    pub storage: Arc<dyn StorageAdapter>,
    /// Upstream sessions.
    pub clients: Arc<ApiClientPool>,
    /// Retry routing.
    pub retry: Arc<RetryScheduler>,
    /// Shared counters.
    pub stats: Arc<RwLock<RuntimeStats>>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// No client could be checked out.
    NoClient,
    /// No entry arrived before the timeout.
    NoEntry,
    /// An entry was handled, whatever the outcome.
    Processed,
}

/// Single worker pulling from one [`ItemSource`].
pub struct ResourceItemWorker {
    id: usize,
    context: WorkerContext,
    source: Arc<dyn ItemSource>,
    cancellation_token: CancellationToken,
    bulk: Bulk,
}

impl ResourceItemWorker {
    /// Creates a worker.
    pub fn new(
        id: usize,
        context: WorkerContext,
        source: Arc<dyn ItemSource>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, context, source, cancellation_token, bulk: Bulk::new() }
    }

    /// Documents buffered but not yet written.
    pub fn pending(&self) -> usize {
        self.bulk.len()
    }

    /// Runs until cancelled, then flushes the bulk.
    ///
    /// # Errors
    ///
    /// Never fails today; per-item failures are retried, not returned.
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = self.id, queue = self.source.name(), "resource item worker starting");

        loop {
            self.flush_if_due(false).await;
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if self.run_once().await == Iteration::NoClient {
                tokio::select! {
                    () = self.context.clock.sleep(self.context.config.worker_sleep) => {},
                    () = self.cancellation_token.cancelled() => {},
                }
            }
        }

        self.flush_if_due(true).await;
        info!(worker_id = self.id, queue = self.source.name(), "resource item worker stopped");
        Ok(())
    }

    /// Performs one acquire, take, process and release cycle.
    pub async fn run_once(&mut self) -> Iteration {
        let timeout = self.context.config.queue_timeout;

        let Some(mut client) = self.context.clients.acquire(timeout).await else {
            debug!(worker_id = self.id, "no api client available");
            return Iteration::NoClient;
        };

        let entry = tokio::select! {
            entry = self.source.next_entry(timeout) => entry,
            () = self.cancellation_token.cancelled() => None,
        };
        let Some(entry) = entry else {
            self.context.clients.release(client).await;
            return Iteration::NoEntry;
        };

        self.process(entry, &mut client).await;
        self.context.clients.release(client).await;
        Iteration::Processed
    }

    async fn process(&mut self, entry: QueueEntry, client: &mut ApiClientHandle) {
        let QueueEntry { reference, retry, .. } = entry;

        let mut prefetched = None;
        let reference = if reference.date_modified.is_none() {
            match self.fetch(client, &reference.id).await {
                Ok(document) => {
                    let resolved = document.reference();
                    prefetched = Some(document);
                    resolved
                },
                Err(e) => {
                    self.on_fetch_error(client, reference, retry, e).await;
                    return;
                },
            }
        } else {
            reference
        };

        let local = match self.context.storage.check(reference.clone()).await {
            Ok(local) => local,
            Err(e) => {
                error!(
                    worker_id = self.id,
                    resource_id = %reference.id,
                    message_id = e.message_id(),
                    code = e.code(),
                    error = %e,
                    "local check failed"
                );
                self.context.stats.write().await.exceptions_count += 1;
                self.context.retry.schedule(reference, retry, FailureKind::Generic).await;
                return;
            },
        };

        if local.is_current {
            debug!(worker_id = self.id, resource_id = %reference.id, "local copy is current, skipped");
            self.context.stats.write().await.skipped += 1;
            return;
        }

        let document = match prefetched {
            Some(document) => document,
            None => match self.fetch(client, &reference.id).await {
                Ok(document) => document,
                Err(e) => {
                    self.on_fetch_error(client, reference, retry, e).await;
                    return;
                },
            },
        };

        if reference.date_modified.is_some_and(|wanted| document.date_modified() < wanted) {
            info!(
                worker_id = self.id,
                resource_id = %reference.id,
                received = %document.date_modified(),
                "received stale document"
            );
            self.context.stats.write().await.not_actual_docs_count += 1;
            self.context.retry.schedule(reference, retry, FailureKind::Generic).await;
            return;
        }

        let mut document = document;
        document.prepare_for_storage(self.context.config.resource, local.revision.as_deref());
        self.bulk.accumulate(document, retry, self.context.clock.now());
    }

    async fn fetch(&self, client: &mut ApiClientHandle, id: &str) -> Result<ResourceDocument> {
        let started = self.context.clock.now();
        let result = client.session.get_resource_item(id).await;
        let elapsed = self.context.clock.now().saturating_duration_since(started);
        client.record_request(self.context.clock.now_system(), elapsed);

        if result.is_ok() {
            client.record_success(self.context.config.client_dec_step_timeout);
        }
        result
    }

    async fn on_fetch_error(
        &self,
        client: &mut ApiClientHandle,
        reference: ResourceItemReference,
        retry: RetryMetadata,
        error: BridgeError,
    ) {
        let config = &self.context.config;
        match &error {
            BridgeError::RateLimited => {
                let action = client.record_rate_limit(
                    config.client_inc_step_timeout,
                    config.drop_threshold_client_cookies,
                );
                warn!(
                    worker_id = self.id,
                    client_id = %client.id,
                    resource_id = %reference.id,
                    message_id = error.message_id(),
                    request_interval = client.request_interval.as_secs_f64(),
                    renew = action == RateLimitAction::Renew,
                    "rate limited by upstream"
                );
            },
            BridgeError::NotFound { status_code, .. } => {
                client.drop_cookies = true;
                self.context.stats.write().await.not_found_count += 1;
                warn!(
                    worker_id = self.id,
                    resource_id = %reference.id,
                    message_id = error.message_id(),
                    status_code,
                    "resource not found upstream"
                );
            },
            _ => {
                self.context.stats.write().await.exceptions_count += 1;
                error!(
                    worker_id = self.id,
                    resource_id = %reference.id,
                    message_id = error.message_id(),
                    code = error.code(),
                    error = %error,
                    "failed to fetch resource item"
                );
            },
        }

        self.context.retry.schedule(reference, retry, FailureKind::from(&error)).await;
    }

    async fn flush_if_due(&mut self, stopping: bool) {
        let config = &self.context.config;
        let due = self.bulk.should_flush(
            self.context.clock.now(),
            config.bulk_save_limit,
            config.bulk_save_interval,
            stopping,
        );
        if due {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        let entries = self.bulk.take();
        let mut pending = HashMap::with_capacity(entries.len());
        let mut documents = Vec::with_capacity(entries.len());
        for entry in entries {
            pending.insert(entry.document.id().to_string(), (entry.document.reference(), entry.retry));
            documents.push(entry.document);
        }
        let count = documents.len();

        match self.context.storage.save(documents).await {
            Ok(report) => {
                {
                    let mut stats = self.context.stats.write().await;
                    stats.save_documents += report.created.len() as u64;
                    stats.update_documents += report.updated.len() as u64;
                    stats.skipped += report.skipped.len() as u64;
                }
                debug!(
                    worker_id = self.id,
                    created = report.created.len(),
                    updated = report.updated.len(),
                    skipped = report.skipped.len(),
                    retry = report.retry.len(),
                    "flushed bulk"
                );
                for id in report.retry {
                    let retry = pending.get(&id).map_or_else(
                        || self.context.retry.policy().initial_metadata(),
                        |(_, retry)| *retry,
                    );
                    self.context
                        .retry
                        .schedule(ResourceItemReference::unresolved(id), retry, FailureKind::Generic)
                        .await;
                }
            },
            Err(e) => {
                error!(
                    worker_id = self.id,
                    docs = count,
                    message_id = e.message_id(),
                    code = e.code(),
                    error = %e,
                    "bulk save failed, retrying every document"
                );
                self.context.stats.write().await.exceptions_count += 1;
                for (reference, retry) in pending.into_values() {
                    self.context.retry.schedule(reference, retry, FailureKind::Generic).await;
                }
            },
        }
    }
}
