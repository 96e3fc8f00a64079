//! Synchronization bridge replicating upstream procurement resources into a
//! local document store.
//!
//! The bridge reads changed item references from the upstream change feed,
//! drops the ones the local store already holds, and hands the rest to a
//! resizable pool of workers that fetch full documents and write them in
//! bulk. Failures are retried through a delayed retry queue served by its
//! own workers.
//!
//! # Architecture
//!
//! 1. **Feed pump** - Batches feed references and filters them against the
//!    store
//! 2. **Retrieval queue** - Bounded priority queue with backpressure
//! 3. **Workers** - Check out an API client, fetch, buffer and flush
//! 4. **Retry queue** - Delay queue releasing entries once their backoff
//!    elapses
//! 5. **Control loops** - Size worker pools, watch index lag and client
//!    performance, report stats
//!
//! # Key Features
//!
//! - **Adaptive clients** - Per-session request interval grows on 429 and
//!   shrinks on success; slow sessions are replaced
//! - **Monotonic writes** - The store never accepts an older document over a
//!   newer one
//! - **Graceful shutdown** - Workers flush their bulks before exit
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use edge_bridge::{
//!     config::{Config, DEFAULT_CONFIG_FILE},
//!     feed::HttpChangeFeed,
//!     storage,
//!     BridgeEngine, BridgeError,
//! };
//! use edge_core::{Clock, RealClock};
//!
//! # async fn example() -> std::result::Result<(), BridgeError> {
//! let config = Config::load(DEFAULT_CONFIG_FILE)?;
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//!
//! let storage = storage::open(config.to_storage_config(), clock.clone()).await?;
//! let feed = HttpChangeFeed::new(config.to_feed_config(), clock.clone())?;
//!
//! let mut engine =
//!     BridgeEngine::new(config.to_bridge_config(), storage, Arc::new(feed), clock);
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bulk;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod storage;
pub mod worker;
pub mod worker_pool;

// Re-export main public API
pub use config::Config;
pub use engine::{BridgeConfig, BridgeEngine};
pub use error::{BridgeError, Result};
pub use stats::BridgeStats;
