//! Storage abstraction over the local document store.
//!
//! Workers and the feed pump only talk to [`StorageAdapter`]; production
//! uses [`couchdb::CouchStorage`] or [`elasticsearch::ElasticStorage`] as
//! selected by [`StorageBackend`], tests use [`mock::MockStorage`].

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use edge_core::{Clock, ResourceDocument, ResourceItemReference, ResourceKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BridgeError, Result};

pub mod couchdb;
pub mod elasticsearch;
pub mod mock;

/// Reason the store gives when rejecting a document that is not newer than
/// the stored one.
pub const STALE_WRITE_REASON: &str = "New doc with oldest dateModified.";

/// Outcome of looking up a reference in the local store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCheck {
    /// Local copy is at least as fresh as the reference.
    pub is_current: bool,
    /// Revision of the local copy, if one exists.
    pub revision: Option<String>,
}

/// Per-document outcome of a bulk save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Written for the first time.
    pub created: Vec<String>,
    /// Replaced an older stored version.
    pub updated: Vec<String>,
    /// Rejected because the stored version is equal or newer.
    pub skipped: Vec<String>,
    /// Failed for any other reason; must be retried.
    pub retry: Vec<String>,
}

impl SaveReport {
    /// Documents accounted for in this report.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.skipped.len() + self.retry.len()
    }

    /// Returns true if the report is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Document store the bridge writes into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// CouchDB database with a date view and a stale-write validator.
    #[default]
    CouchDb,
    /// Elasticsearch index written through an alias.
    Elasticsearch,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CouchDb => f.write_str("couchdb"),
            Self::Elasticsearch => f.write_str("elasticsearch"),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Selected backend.
    pub backend: StorageBackend,
    /// CouchDB server URL, may carry credentials.
    pub couch_url: String,
    /// Database name; the index name for Elasticsearch.
    pub db_name: String,
    /// Elasticsearch server URL.
    pub elasticsearch_url: String,
    /// Elasticsearch alias every read and write goes through.
    pub alias: String,
    /// Resource collection stored in this database.
    pub resource: ResourceKind,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Attempts made by `filter` before giving up.
    pub filter_attempts: u32,
    /// Sleep before the first `filter` retry; doubles after each attempt.
    pub filter_backoff: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::CouchDb,
            couch_url: "http://127.0.0.1:5984".to_string(),
            db_name: "edge_db".to_string(),
            elasticsearch_url: "http://127.0.0.1:9200".to_string(),
            alias: "bridge".to_string(),
            resource: ResourceKind::Tenders,
            request_timeout: Duration::from_secs(30),
            filter_attempts: 3,
            filter_backoff: Duration::from_secs(2),
        }
    }
}

/// Operations the bridge needs from the local store.
pub trait StorageAdapter: Send + Sync + 'static {
    /// Compares the local copy of `reference.id` with the reference.
    ///
    /// A reference without a modification date is never current.
    fn check(
        &self,
        reference: ResourceItemReference,
    ) -> Pin<Box<dyn Future<Output = Result<LocalCheck>> + Send + '_>>;

    /// Returns the stored modification date for each id that exists locally.
    ///
    /// Retries transient failures with exponential backoff before returning
    /// an error.
    fn filter(
        &self,
        ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, DateTime<Utc>>>> + Send + '_>>;

    /// Writes documents in one call.
    ///
    /// Per-document rejections are reported in the [`SaveReport`]; an error
    /// means nothing can be assumed about any of them.
    fn save(
        &self,
        documents: Vec<ResourceDocument>,
    ) -> Pin<Box<dyn Future<Output = Result<SaveReport>> + Send + '_>>;

    /// Reads the stored document.
    fn get(
        &self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResourceDocument>>> + Send + '_>>;

    /// Index build progress in percent; 100 means fully built.
    fn index_progress(&self) -> Pin<Box<dyn Future<Output = Result<f64>> + Send + '_>>;

    /// Creates the database or index and installs whatever the backend
    /// needs to answer the other operations.
    fn prepare(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Builds the configured backend and prepares it for use.
///
/// # Errors
///
/// Returns `BridgeError::Configuration` if the adapter cannot be built or the
/// store cannot be prepared, since the bridge cannot start without it.
pub async fn open(config: StorageConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn StorageAdapter>> {
    let backend = config.backend;
    let db_name = config.db_name.clone();
    let storage: Arc<dyn StorageAdapter> = match backend {
        StorageBackend::CouchDb => Arc::new(couchdb::CouchStorage::new(config, clock)?),
        StorageBackend::Elasticsearch => {
            Arc::new(elasticsearch::ElasticStorage::new(config, clock)?)
        },
    };

    storage.prepare().await.map_err(|e| {
        BridgeError::configuration(format!("{backend} storage {db_name} is not usable: {e}"))
    })?;
    info!(backend = %backend, db_name = %db_name, "local storage ready");
    Ok(storage)
}

/// Runs `query` up to `config.filter_attempts` times, sleeping between
/// failures with a backoff that doubles from `config.filter_backoff`.
pub(crate) async fn with_filter_retries<T, F, Fut>(
    config: &StorageConfig,
    clock: &dyn Clock,
    mut query: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.filter_attempts.max(1);
    let mut backoff = config.filter_backoff;
    let mut attempt = 1;
    loop {
        match query().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    message_id = e.message_id(),
                    error = %e,
                    "filter query failed, retrying"
                );
                clock.sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}
