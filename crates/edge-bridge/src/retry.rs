//! Retry policy for failed retrievals.
//!
//! A generic failure doubles the reference's timeout and increments its
//! retry count; a rate-limit response leaves both untouched because the
//! throttling belongs to the client, not the reference. Once the count
//! passes the ceiling the reference is dropped.
//!
//! Accepted retries are scheduled into the retry queue with the current
//! timeout as their delay, so they stay invisible to workers until it
//! elapses.

use std::{sync::Arc, time::Duration};

use edge_core::{QueueEntry, ResourceItemReference, ResourceKind, RetryMetadata};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::{error::BridgeError, queue::RetryQueue, stats::RuntimeStats};

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub default_timeout: Duration,
    /// Retries allowed before a reference is dropped.
    pub max_retries: u32,
    /// How long a retry insert may wait for room in a bounded retry queue.
    pub enqueue_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(3),
            max_retries: 10,
            enqueue_timeout: Duration::from_secs(3),
        }
    }
}

/// How a failure affects retry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport error, bad response, storage error or stale read.
    Generic,
    /// Upstream throttling (HTTP 429).
    RateLimited,
}

impl From<&BridgeError> for FailureKind {
    fn from(error: &BridgeError) -> Self {
        match error {
            BridgeError::RateLimited => Self::RateLimited,
            _ => Self::Generic,
        }
    }
}

/// Outcome of applying the policy to a failed reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue `entry` once `delay` has elapsed.
    Retry {
        /// Entry carrying the updated metadata
        entry: QueueEntry,
        /// Delay before the entry becomes visible
        delay: Duration,
    },
    /// Drop the reference permanently.
    GiveUp {
        /// Retry count that exceeded the ceiling
        retries_count: u32,
    },
}

impl RetryPolicy {
    /// Metadata for a reference entering the pipeline.
    pub fn initial_metadata(&self) -> RetryMetadata {
        RetryMetadata::initial(self.default_timeout)
    }

    /// Applies the policy to a reference that just failed.
    pub fn decide(
        &self,
        reference: ResourceItemReference,
        retry: RetryMetadata,
        kind: FailureKind,
    ) -> RetryDecision {
        let delay = if retry.timeout.is_zero() { self.default_timeout } else { retry.timeout };
        let retry = RetryMetadata { timeout: delay, ..retry };

        let next = match kind {
            FailureKind::Generic => retry.after_failure(),
            FailureKind::RateLimited => retry.after_rate_limit(),
        };

        if next.retries_count > self.max_retries {
            return RetryDecision::GiveUp { retries_count: next.retries_count };
        }

        RetryDecision::Retry { entry: QueueEntry::new(reference, next), delay }
    }
}

/// What happened to a reference handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Placed on the retry queue.
    Scheduled,
    /// Exceeded the retry ceiling.
    Dropped,
    /// Retry queue stayed full past the enqueue timeout.
    Rejected,
}

/// Applies the retry policy and feeds the retry queue.
pub struct RetryScheduler {
    policy: RetryPolicy,
    queue: Arc<RetryQueue>,
    stats: Arc<RwLock<RuntimeStats>>,
    resource: ResourceKind,
}

impl RetryScheduler {
    /// Creates a scheduler writing into `queue`.
    pub fn new(
        policy: RetryPolicy,
        queue: Arc<RetryQueue>,
        stats: Arc<RwLock<RuntimeStats>>,
        resource: ResourceKind,
    ) -> Self {
        Self { policy, queue, stats, resource }
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Underlying retry queue.
    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    /// Routes a failed reference to the retry queue or the drop path.
    pub async fn schedule(
        &self,
        reference: ResourceItemReference,
        retry: RetryMetadata,
        kind: FailureKind,
    ) -> RetryOutcome {
        let resource_id = reference.id.clone();

        match self.policy.decide(reference, retry, kind) {
            RetryDecision::GiveUp { retries_count } => {
                let dropped = BridgeError::retry_exhausted(&resource_id, retries_count);
                error!(
                    severity = "critical",
                    message_id = dropped.message_id(),
                    code = dropped.code(),
                    resource = self.resource.singular(),
                    resource_id = %resource_id,
                    retries_count,
                    max_retries = self.policy.max_retries,
                    "reached retry limit, dropped from retry queue"
                );
                self.stats.write().await.dropped += 1;
                RetryOutcome::Dropped
            },
            RetryDecision::Retry { entry, delay } => {
                let retries_count = entry.retry.retries_count;
                match self.queue.push_after(entry, delay, self.policy.enqueue_timeout).await {
                    Ok(()) => {
                        info!(
                            resource = self.resource.singular(),
                            resource_id = %resource_id,
                            retries_count,
                            delay_seconds = delay.as_secs_f64(),
                            "put to retry queue"
                        );
                        self.stats.write().await.add_to_retry += 1;
                        RetryOutcome::Scheduled
                    },
                    Err(_full) => {
                        error!(
                            message_id = "edge_bridge_retry_queue_full",
                            resource = self.resource.singular(),
                            resource_id = %resource_id,
                            retries_count,
                            "retry queue full, dropped item"
                        );
                        self.stats.write().await.dropped += 1;
                        RetryOutcome::Rejected
                    },
                }
            },
        }
    }
}
