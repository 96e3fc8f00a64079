//! Runtime counters and the periodic stats snapshot.

use chrono::{DateTime, Utc};
use edge_core::ResourceKind;
use serde::Serialize;

use crate::feed::FeedInfo;

/// Process-wide counters updated by workers and control loops.
///
/// Lives for the lifetime of the orchestrator and is only reset when a
/// snapshot is collected with reset requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// References the feed pump placed on the retrieval queue.
    pub add_to_resource_items_queue: u64,
    /// Documents written for the first time.
    pub save_documents: u64,
    /// Documents replaced with a newer version.
    pub update_documents: u64,
    /// References skipped because the local copy was already current.
    pub skipped: u64,
    /// References dropped after exceeding the retry ceiling.
    pub dropped: u64,
    /// References scheduled for retry.
    pub add_to_retry: u64,
    /// Failures encountered while processing items.
    pub exceptions_count: u64,
    /// Upstream 404/410 responses.
    pub not_found_count: u64,
    /// Upstream documents older than the reference that requested them.
    pub not_actual_docs_count: u64,
    /// Failed attempts to create an API client.
    pub client_create_failures: u64,
    /// Client sessions renewed after a cookie drop.
    pub renewed_clients: u64,
    /// Clients retired by the performance watcher.
    pub replaced_clients: u64,
}

impl RuntimeStats {
    /// Zeroes every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Min, mean, max and population standard deviation of a sample set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DurationSummary {
    /// Smallest sample, in seconds.
    pub min: f64,
    /// Arithmetic mean, in seconds.
    pub avg: f64,
    /// Largest sample, in seconds.
    pub max: f64,
    /// Population standard deviation, in seconds.
    pub std_dev: f64,
}

impl DurationSummary {
    /// Summarizes `values`; all fields are zero for an empty slice.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self { min, avg: mean(values), max, std_dev: population_std_dev(values) }
    }
}

/// Arithmetic mean, zero for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation, zero for an empty slice.
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let avg = mean(values);
    let variance =
        values.iter().map(|value| (value - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Snapshot exposed for external telemetry scraping.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    /// When the snapshot was taken.
    pub time: DateTime<Utc>,
    /// Replicated resource collection.
    pub resource: ResourceKind,
    /// Entries waiting in the retrieval queue.
    pub resource_items_queue_size: usize,
    /// Retry entries whose delay has elapsed.
    pub retry_resource_items_queue_size: usize,
    /// Retry entries still waiting out their delay.
    pub retry_pending_items: usize,
    /// Running main workers.
    pub workers_count: usize,
    /// Running retry workers.
    pub retry_workers_count: usize,
    /// API clients alive in the pool.
    pub api_clients_count: usize,
    /// API clients idle and eligible right now.
    pub free_api_clients: usize,
    /// Client request duration summary over the retention window.
    pub request_durations: DurationSummary,
    /// True while the index-lag watcher is holding workers at their floor.
    pub index_throttled: bool,
    /// Counters accumulated since the previous reset.
    #[serde(flatten)]
    pub counters: RuntimeStats,
    /// Forward feed progress.
    pub forward_info: FeedInfo,
    /// Backward feed progress.
    pub backward_info: FeedInfo,
}
