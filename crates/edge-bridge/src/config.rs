//! Configuration for the edge bridge.

use std::{path::Path, time::Duration};

use edge_core::ResourceKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    client::ClientConfig,
    engine::BridgeConfig,
    error::{BridgeError, Result},
    feed::FeedConfig,
    pool::PoolConfig,
    queue::Capacity,
    retry::RetryPolicy,
    storage::{StorageBackend, StorageConfig},
    worker::WorkerConfig,
};

/// Configuration file read when no path is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "edge.toml";

/// Prefix of environment variable overrides, e.g. `EDGE_WORKERS_MAX`.
pub const ENV_PREFIX: &str = "EDGE_";

/// Minimum pause after the forward feed runs dry, in seconds.
pub const MIN_FEED_UP_WAIT_SLEEP: f64 = 30.0;

/// Complete bridge configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `EDGE_` (highest priority)
/// 2. Configuration file (`edge.toml` or the path given on the command line)
/// 3. Built-in defaults (lowest priority)
///
/// Every setting except `resources_api_server` has a working default.
/// Durations are expressed in seconds.
///
/// # Example
///
/// ```no_run
/// use edge_bridge::config::{Config, DEFAULT_CONFIG_FILE};
///
/// let config = Config::load(DEFAULT_CONFIG_FILE).expect("Failed to load configuration");
///
/// println!("Replicating {} from {}", config.resource, config.resources_api_server);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Upstream API
    /// Upstream API host, e.g. `https://public.api.openprocurement.org`.
    ///
    /// Environment variable: `EDGE_RESOURCES_API_SERVER`
    #[serde(default)]
    pub resources_api_server: String,
    /// API version path segment.
    #[serde(default = "default_api_version")]
    pub resources_api_version: String,
    /// Replicated resource collection.
    #[serde(default)]
    pub resource: ResourceKind,
    /// Base user agent sent by every session.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Identifier of this bridge instance, part of every client user agent.
    #[serde(default = "default_bridge_id")]
    pub bridge_id: String,
    /// Feed `mode` parameter.
    #[serde(default = "default_retrieve_mode")]
    pub retrieve_mode: String,
    /// Feed page size.
    #[serde(default = "default_resource_items_limit")]
    pub resource_items_limit: usize,
    /// Pause after the forward feed runs dry.
    #[serde(default = "default_feed_up_wait_sleep")]
    pub feed_up_wait_sleep: f64,
    /// Pause after a feed transport failure.
    #[serde(default = "default_feed_error_sleep")]
    pub feed_error_sleep: f64,
    /// Upstream and storage request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    // Clients and workers
    /// Upper bound on live API clients.
    #[serde(default = "default_api_clients_count")]
    pub api_clients_count: usize,
    /// Floor of the main worker pool.
    #[serde(default = "default_workers_min")]
    pub workers_min: usize,
    /// Ceiling of the main worker pool.
    #[serde(default = "default_workers_max")]
    pub workers_max: usize,
    /// Floor of the retry worker pool.
    #[serde(default = "default_retry_workers_min")]
    pub retry_workers_min: usize,
    /// Ceiling of the retry worker pool.
    #[serde(default = "default_retry_workers_max")]
    pub retry_workers_max: usize,
    /// Queue fill percentage above which a worker is added.
    #[serde(default = "default_workers_inc_threshold")]
    pub workers_inc_threshold: u32,
    /// Queue fill percentage below which a worker is retired.
    #[serde(default = "default_workers_dec_threshold")]
    pub workers_dec_threshold: u32,

    // Queues
    /// Retrieval queue capacity, `-1` for unbounded.
    #[serde(default = "default_resource_items_queue_size")]
    pub resource_items_queue_size: i64,
    /// Retry queue capacity, `-1` for unbounded.
    #[serde(default = "default_retry_resource_items_queue_size")]
    pub retry_resource_items_queue_size: i64,

    // Retry and client backoff
    /// Delay before the first retry of a reference.
    #[serde(default = "default_retry_default_timeout")]
    pub retry_default_timeout: f64,
    /// Retries allowed before a reference is dropped.
    #[serde(default = "default_retries_count")]
    pub retries_count: u32,
    /// Client interval growth per 429.
    #[serde(default = "default_client_inc_step_timeout")]
    pub client_inc_step_timeout: f64,
    /// Client interval shrink per successful fetch.
    #[serde(default = "default_client_dec_step_timeout")]
    pub client_dec_step_timeout: f64,
    /// Client interval past which a 429 renews the session.
    #[serde(default = "default_drop_threshold_client_cookies")]
    pub drop_threshold_client_cookies: f64,

    // Workers and batching
    /// Worker pause after failing to get a client.
    #[serde(default = "default_worker_sleep")]
    pub worker_sleep: f64,
    /// Wait for a client, a queue entry or queue room.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout: f64,
    /// Documents per bulk write.
    #[serde(default = "default_bulk_save_limit")]
    pub bulk_save_limit: usize,
    /// Maximum age of a non-empty bulk.
    #[serde(default = "default_bulk_save_interval")]
    pub bulk_save_interval: f64,
    /// Feed items per storage filter query.
    #[serde(default = "default_bulk_query_limit")]
    pub bulk_query_limit: usize,
    /// Maximum age of a feed batch before it is filtered.
    #[serde(default = "default_bulk_query_interval")]
    pub bulk_query_interval: f64,

    // Control loops
    /// Pool-size controller period.
    #[serde(default = "default_queues_controller_timeout")]
    pub queues_controller_timeout: f64,
    /// Stats reporter period.
    #[serde(default = "default_watch_interval")]
    pub watch_interval: f64,
    /// Performance watcher period.
    #[serde(default = "default_performance_watch_interval")]
    pub performance_watch_interval: f64,
    /// Index-lag watcher period.
    #[serde(default = "default_index_watch_interval")]
    pub index_watch_interval: f64,
    /// How long request duration samples are kept.
    #[serde(default = "default_request_duration_retention")]
    pub request_duration_retention: f64,
    /// Multiple of the population mean above which a client is degraded.
    #[serde(default = "default_degraded_mean_multiplier")]
    pub degraded_mean_multiplier: f64,
    /// Maximum wait for tasks to drain at shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    // Storage
    /// Document store backend, `couchdb` or `elasticsearch`.
    ///
    /// Environment variable: `EDGE_STORAGE`
    #[serde(default)]
    pub storage: StorageBackend,
    /// CouchDB server URL, may carry credentials.
    ///
    /// Environment variable: `EDGE_COUCH_URL`
    #[serde(default = "default_couch_url")]
    pub couch_url: String,
    /// Database name; the index name for Elasticsearch.
    #[serde(default = "default_db_name")]
    pub db_name: String,
    /// Elasticsearch server URL.
    #[serde(default = "default_elasticsearch_url")]
    pub elasticsearch_url: String,
    /// Elasticsearch alias over the index.
    #[serde(default = "default_elasticsearch_alias")]
    pub elasticsearch_alias: String,

    // Logging
    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, the file at `path`, and `EDGE_`
    /// environment overrides, then validates it.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if a value cannot be parsed or
    /// fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment
            .extract()
            .map_err(|e| BridgeError::configuration(format!("failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.resources_api_server.trim().is_empty() {
            return Err(BridgeError::configuration("resources_api_server must be set"));
        }
        let host = Url::parse(&self.resources_api_server).map_err(|e| {
            BridgeError::configuration(format!("resources_api_server is not a valid url: {e}"))
        })?;
        if !matches!(host.scheme(), "http" | "https") || host.host_str().is_none() {
            return Err(BridgeError::configuration(
                "resources_api_server must be an http(s) url with a host",
            ));
        }

        if self.feed_up_wait_sleep < MIN_FEED_UP_WAIT_SLEEP {
            return Err(BridgeError::configuration(format!(
                "feed_up_wait_sleep must be at least {MIN_FEED_UP_WAIT_SLEEP} seconds"
            )));
        }

        if self.workers_min > self.workers_max {
            return Err(BridgeError::configuration("workers_min cannot exceed workers_max"));
        }

        if self.retry_workers_min > self.retry_workers_max {
            return Err(BridgeError::configuration(
                "retry_workers_min cannot exceed retry_workers_max",
            ));
        }

        if self.workers_inc_threshold > 100 || self.workers_dec_threshold > 100 {
            return Err(BridgeError::configuration("worker thresholds must be between 0 and 100"));
        }

        for (name, size) in [
            ("resource_items_queue_size", self.resource_items_queue_size),
            ("retry_resource_items_queue_size", self.retry_resource_items_queue_size),
        ] {
            if size == 0 || size < -1 {
                return Err(BridgeError::configuration(format!(
                    "{name} must be positive or -1 for unbounded"
                )));
            }
        }

        if self.retries_count == 0 {
            return Err(BridgeError::configuration("retries_count must be greater than 0"));
        }

        if self.bulk_save_limit == 0 || self.bulk_query_limit == 0 || self.resource_items_limit == 0
        {
            return Err(BridgeError::configuration("bulk and page limits must be greater than 0"));
        }

        if self.api_clients_count == 0 {
            return Err(BridgeError::configuration("api_clients_count must be greater than 0"));
        }

        let durations = [
            ("feed_error_sleep", self.feed_error_sleep),
            ("retry_default_timeout", self.retry_default_timeout),
            ("client_inc_step_timeout", self.client_inc_step_timeout),
            ("client_dec_step_timeout", self.client_dec_step_timeout),
            ("drop_threshold_client_cookies", self.drop_threshold_client_cookies),
            ("worker_sleep", self.worker_sleep),
            ("queue_timeout", self.queue_timeout),
            ("bulk_save_interval", self.bulk_save_interval),
            ("bulk_query_interval", self.bulk_query_interval),
            ("queues_controller_timeout", self.queues_controller_timeout),
            ("watch_interval", self.watch_interval),
            ("performance_watch_interval", self.performance_watch_interval),
            ("index_watch_interval", self.index_watch_interval),
            ("request_duration_retention", self.request_duration_retention),
        ];
        for (name, seconds) in durations {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(BridgeError::configuration(format!(
                    "{name} must be a non-negative number of seconds"
                )));
            }
        }

        // Control loops sleep for these periods between ticks.
        let periods = [
            ("queues_controller_timeout", self.queues_controller_timeout),
            ("watch_interval", self.watch_interval),
            ("performance_watch_interval", self.performance_watch_interval),
            ("index_watch_interval", self.index_watch_interval),
        ];
        for (name, seconds) in periods {
            if seconds <= 0.0 {
                return Err(BridgeError::configuration(format!("{name} must be positive")));
            }
        }

        if !self.degraded_mean_multiplier.is_finite() || self.degraded_mean_multiplier <= 0.0 {
            return Err(BridgeError::configuration("degraded_mean_multiplier must be positive"));
        }

        if self.db_name.trim().is_empty() {
            return Err(BridgeError::configuration("db_name must be set"));
        }
        match self.storage {
            StorageBackend::CouchDb if self.couch_url.trim().is_empty() => {
                return Err(BridgeError::configuration("couch_url must be set for couchdb storage"));
            },
            StorageBackend::Elasticsearch
                if self.elasticsearch_url.trim().is_empty()
                    || self.elasticsearch_alias.trim().is_empty() =>
            {
                return Err(BridgeError::configuration(
                    "elasticsearch_url and elasticsearch_alias must be set for elasticsearch storage",
                ));
            },
            _ => {},
        }

        Ok(())
    }

    /// Convert to the orchestrator's configuration.
    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            resource: self.resource,
            workers_min: self.workers_min,
            workers_max: self.workers_max,
            retry_workers_min: self.retry_workers_min,
            retry_workers_max: self.retry_workers_max,
            workers_inc_threshold: self.workers_inc_threshold,
            workers_dec_threshold: self.workers_dec_threshold,
            resource_items_queue_size: Capacity::from_config(self.resource_items_queue_size),
            retry_resource_items_queue_size: Capacity::from_config(
                self.retry_resource_items_queue_size,
            ),
            bulk_query_limit: self.bulk_query_limit,
            bulk_query_interval: seconds(self.bulk_query_interval),
            feed_up_wait_sleep: seconds(self.feed_up_wait_sleep),
            feed_error_sleep: seconds(self.feed_error_sleep),
            queue_timeout: seconds(self.queue_timeout),
            queues_controller_timeout: seconds(self.queues_controller_timeout),
            watch_interval: seconds(self.watch_interval),
            performance_watch_interval: seconds(self.performance_watch_interval),
            index_watch_interval: seconds(self.index_watch_interval),
            request_duration_retention: seconds(self.request_duration_retention),
            degraded_mean_multiplier: self.degraded_mean_multiplier,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            worker: self.to_worker_config(),
            pool: self.to_pool_config(),
            retry: self.to_retry_policy(),
        }
    }

    /// Convert to upstream session settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.resources_api_server.clone(),
            api_version: self.resources_api_version.clone(),
            resource: self.resource,
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.request_timeout),
        }
    }

    /// Convert to client pool settings.
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            client: self.to_client_config(),
            bridge_id: self.bridge_id.clone(),
            max_clients: self.api_clients_count,
        }
    }

    /// Convert to change feed settings.
    pub fn to_feed_config(&self) -> FeedConfig {
        FeedConfig {
            client: self.to_client_config(),
            user_agent: format!("{}/{}/feed", self.user_agent, self.bridge_id),
            retrieve_mode: self.retrieve_mode.clone(),
            limit: self.resource_items_limit,
        }
    }

    /// Convert to storage adapter settings.
    pub fn to_storage_config(&self) -> StorageConfig {
        StorageConfig {
            backend: self.storage,
            couch_url: self.couch_url.clone(),
            db_name: self.db_name.clone(),
            elasticsearch_url: self.elasticsearch_url.clone(),
            alias: self.elasticsearch_alias.clone(),
            resource: self.resource,
            request_timeout: Duration::from_secs(self.request_timeout),
            ..StorageConfig::default()
        }
    }

    /// Convert to worker settings.
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            resource: self.resource,
            worker_sleep: seconds(self.worker_sleep),
            queue_timeout: seconds(self.queue_timeout),
            bulk_save_limit: self.bulk_save_limit,
            bulk_save_interval: seconds(self.bulk_save_interval),
            client_inc_step_timeout: seconds(self.client_inc_step_timeout),
            client_dec_step_timeout: seconds(self.client_dec_step_timeout),
            drop_threshold_client_cookies: seconds(self.drop_threshold_client_cookies),
        }
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            default_timeout: seconds(self.retry_default_timeout),
            max_retries: self.retries_count,
            enqueue_timeout: seconds(self.queue_timeout),
        }
    }

    /// Get CouchDB URL with password masked for logging.
    pub fn couch_url_masked(&self) -> String {
        if let Some(at_pos) = self.couch_url.find('@') {
            if let Some(colon_pos) = self.couch_url[..at_pos].rfind(':') {
                if !self.couch_url[colon_pos..at_pos].starts_with("://") {
                    let mut masked = self.couch_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.couch_url.clone()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resources_api_server: String::new(),
            resources_api_version: default_api_version(),
            resource: ResourceKind::default(),
            user_agent: default_user_agent(),
            bridge_id: default_bridge_id(),
            retrieve_mode: default_retrieve_mode(),
            resource_items_limit: default_resource_items_limit(),
            feed_up_wait_sleep: default_feed_up_wait_sleep(),
            feed_error_sleep: default_feed_error_sleep(),
            request_timeout: default_request_timeout(),
            api_clients_count: default_api_clients_count(),
            workers_min: default_workers_min(),
            workers_max: default_workers_max(),
            retry_workers_min: default_retry_workers_min(),
            retry_workers_max: default_retry_workers_max(),
            workers_inc_threshold: default_workers_inc_threshold(),
            workers_dec_threshold: default_workers_dec_threshold(),
            resource_items_queue_size: default_resource_items_queue_size(),
            retry_resource_items_queue_size: default_retry_resource_items_queue_size(),
            retry_default_timeout: default_retry_default_timeout(),
            retries_count: default_retries_count(),
            client_inc_step_timeout: default_client_inc_step_timeout(),
            client_dec_step_timeout: default_client_dec_step_timeout(),
            drop_threshold_client_cookies: default_drop_threshold_client_cookies(),
            worker_sleep: default_worker_sleep(),
            queue_timeout: default_queue_timeout(),
            bulk_save_limit: default_bulk_save_limit(),
            bulk_save_interval: default_bulk_save_interval(),
            bulk_query_limit: default_bulk_query_limit(),
            bulk_query_interval: default_bulk_query_interval(),
            queues_controller_timeout: default_queues_controller_timeout(),
            watch_interval: default_watch_interval(),
            performance_watch_interval: default_performance_watch_interval(),
            index_watch_interval: default_index_watch_interval(),
            request_duration_retention: default_request_duration_retention(),
            degraded_mean_multiplier: default_degraded_mean_multiplier(),
            shutdown_timeout: default_shutdown_timeout(),
            storage: StorageBackend::default(),
            couch_url: default_couch_url(),
            db_name: default_db_name(),
            elasticsearch_url: default_elasticsearch_url(),
            elasticsearch_alias: default_elasticsearch_alias(),
            rust_log: default_log_level(),
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn default_api_version() -> String {
    "2.5".to_string()
}

fn default_user_agent() -> String {
    "edge.multi".to_string()
}

fn default_bridge_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn default_retrieve_mode() -> String {
    "_all_".to_string()
}

fn default_resource_items_limit() -> usize {
    1000
}

fn default_feed_up_wait_sleep() -> f64 {
    30.0
}

fn default_feed_error_sleep() -> f64 {
    5.0
}

fn default_request_timeout() -> u64 {
    30
}

fn default_api_clients_count() -> usize {
    5
}

fn default_workers_min() -> usize {
    1
}

fn default_workers_max() -> usize {
    3
}

fn default_retry_workers_min() -> usize {
    1
}

fn default_retry_workers_max() -> usize {
    2
}

fn default_workers_inc_threshold() -> u32 {
    75
}

fn default_workers_dec_threshold() -> u32 {
    35
}

fn default_resource_items_queue_size() -> i64 {
    10000
}

fn default_retry_resource_items_queue_size() -> i64 {
    -1
}

fn default_retry_default_timeout() -> f64 {
    3.0
}

fn default_retries_count() -> u32 {
    10
}

fn default_client_inc_step_timeout() -> f64 {
    0.1
}

fn default_client_dec_step_timeout() -> f64 {
    0.02
}

fn default_drop_threshold_client_cookies() -> f64 {
    2.0
}

fn default_worker_sleep() -> f64 {
    5.0
}

fn default_queue_timeout() -> f64 {
    3.0
}

fn default_bulk_save_limit() -> usize {
    1000
}

fn default_bulk_save_interval() -> f64 {
    5.0
}

fn default_bulk_query_limit() -> usize {
    1000
}

fn default_bulk_query_interval() -> f64 {
    5.0
}

fn default_queues_controller_timeout() -> f64 {
    60.0
}

fn default_watch_interval() -> f64 {
    10.0
}

fn default_performance_watch_interval() -> f64 {
    60.0
}

fn default_index_watch_interval() -> f64 {
    60.0
}

fn default_request_duration_retention() -> f64 {
    300.0
}

fn default_degraded_mean_multiplier() -> f64 {
    1.5
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_couch_url() -> String {
    "http://127.0.0.1:5984".to_string()
}

fn default_db_name() -> String {
    "edge_db".to_string()
}

fn default_elasticsearch_url() -> String {
    "http://127.0.0.1:9200".to_string()
}

fn default_elasticsearch_alias() -> String {
    "bridge".to_string()
}

fn default_log_level() -> String {
    "info,edge=debug".to_string()
}
