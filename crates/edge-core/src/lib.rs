//! Core domain types shared by the edge bridge crates.
//!
//! Holds the resource references that flow through the bridge queues, the
//! document wrapper persisted to the local store, decoding errors, and the
//! clock abstraction every timed loop in the bridge is written against.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    parse_timestamp, ClientId, FeedDirection, QueueEntry, ResourceDocument, ResourceItemReference,
    ResourceKind, RetryMetadata,
};
pub use time::{Clock, RealClock, TestClock};
