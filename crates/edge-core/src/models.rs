//! Domain models and strongly-typed identifiers.
//!
//! Defines the references that travel through the retrieval and retry
//! queues, the retry bookkeeping attached to them, and the document wrapper
//! the bridge writes to the local store.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Strongly-typed API client identifier.
///
/// Each upstream session in the client pool carries one of these for its
/// whole life, including across cookie renewals.
///
/// # Example
///
/// ```
/// use edge_core::models::ClientId;
/// let client_id = ClientId::new();
/// println!("created client {}", client_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Creates a new random client ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl From<Uuid> for ClientId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Upstream resource collection replicated by a bridge instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Procurement tenders.
    #[default]
    Tenders,
    /// Auctions.
    Auctions,
    /// Contracts.
    Contracts,
    /// Procurement plans.
    Plans,
}

impl ResourceKind {
    /// Collection name as used in API paths.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tenders => "tenders",
            Self::Auctions => "auctions",
            Self::Contracts => "contracts",
            Self::Plans => "plans",
        }
    }

    /// Singular lower-case name, used in log lines.
    pub const fn singular(&self) -> &'static str {
        match self {
            Self::Tenders => "tender",
            Self::Auctions => "auction",
            Self::Contracts => "contract",
            Self::Plans => "plan",
        }
    }

    /// Value written to `doc_type` on stored documents.
    pub const fn doc_type(&self) -> &'static str {
        match self {
            Self::Tenders => "Tender",
            Self::Auctions => "Auction",
            Self::Contracts => "Contract",
            Self::Plans => "Plan",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tenders" => Ok(Self::Tenders),
            "auctions" => Ok(Self::Auctions),
            "contracts" => Ok(Self::Contracts),
            "plans" => Ok(Self::Plans),
            other => Err(CoreError::UnknownResource(other.to_string())),
        }
    }
}

/// Direction of the change feed an item was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedDirection {
    /// Newly changed items, newest first.
    Forward,
    /// Historical backfill.
    Backward,
}

impl fmt::Display for FeedDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => f.write_str("forward"),
            Self::Backward => f.write_str("backward"),
        }
    }
}

/// Pointer to one upstream resource item and the version the feed reported.
///
/// A reference without `date_modified` has unknown freshness; the worker
/// resolves it from the upstream API before the staleness check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceItemReference {
    /// Resource identifier.
    pub id: String,
    /// Last modification reported upstream.
    #[serde(rename = "dateModified")]
    pub date_modified: Option<DateTime<Utc>>,
}

impl ResourceItemReference {
    /// Creates a reference with a known modification time.
    pub fn new(id: impl Into<String>, date_modified: DateTime<Utc>) -> Self {
        Self { id: id.into(), date_modified: Some(date_modified) }
    }

    /// Creates a reference whose modification time must be resolved first.
    pub fn unresolved(id: impl Into<String>) -> Self {
        Self { id: id.into(), date_modified: None }
    }

    /// Returns true if `other` names the same item with a strictly fresher
    /// version.
    pub fn is_superseded_by(&self, other: &Self) -> bool {
        self.id == other.id
            && match (self.date_modified, other.date_modified) {
                (Some(current), Some(candidate)) => candidate > current,
                (None, Some(_)) => true,
                _ => false,
            }
    }
}

/// Backoff state carried by a reference between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Delay applied before the next attempt becomes visible.
    pub timeout: Duration,
    /// Generic failures recorded so far.
    pub retries_count: u32,
}

impl RetryMetadata {
    /// Fresh metadata for a reference that has not failed yet.
    pub const fn initial(timeout: Duration) -> Self {
        Self { timeout, retries_count: 0 }
    }

    /// Metadata after a generic failure: timeout doubles, count increments.
    pub fn after_failure(self) -> Self {
        Self {
            timeout: self.timeout.saturating_mul(2),
            retries_count: self.retries_count.saturating_add(1),
        }
    }

    /// Metadata after a rate-limit response: unchanged.
    pub const fn after_rate_limit(self) -> Self {
        self
    }
}

/// Entry stored in the retrieval and retry queues.
///
/// Priority tracks the retry count so retried references sort after fresh
/// ones; entries with equal priority are served in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Queue priority, lower is served first.
    pub priority: u32,
    /// Referenced resource item.
    pub reference: ResourceItemReference,
    /// Retry bookkeeping.
    pub retry: RetryMetadata,
}

impl QueueEntry {
    /// Creates an entry whose priority follows its retry count.
    pub fn new(reference: ResourceItemReference, retry: RetryMetadata) -> Self {
        Self { priority: retry.retries_count, reference, retry }
    }
}

/// Full resource document as returned upstream and stored locally.
///
/// Guaranteed to carry a string `id` and a parseable `dateModified`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDocument {
    id: String,
    date_modified: DateTime<Utc>,
    body: Map<String, Value>,
}

impl ResourceDocument {
    /// Validates and wraps a raw JSON document.
    ///
    /// # Errors
    ///
    /// Returns error if the value is not an object or lacks a valid `id` or
    /// `dateModified`.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(body) = value else {
            return Err(CoreError::InvalidDocument("expected a JSON object".to_string()));
        };

        let id = body
            .get("id")
            .or_else(|| body.get("_id"))
            .and_then(Value::as_str)
            .ok_or(CoreError::MissingField { field: "id" })?
            .to_string();

        let raw_date = body
            .get("dateModified")
            .and_then(Value::as_str)
            .ok_or(CoreError::MissingField { field: "dateModified" })?;
        let date_modified = parse_timestamp(raw_date)?;

        Ok(Self { id, date_modified, body })
    }

    /// Resource identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last modification time.
    pub fn date_modified(&self) -> DateTime<Utc> {
        self.date_modified
    }

    /// Local store revision, if the document was read from storage.
    pub fn revision(&self) -> Option<&str> {
        self.body.get("_rev").and_then(Value::as_str)
    }

    /// Reference describing this document's version.
    pub fn reference(&self) -> ResourceItemReference {
        ResourceItemReference::new(self.id.clone(), self.date_modified)
    }

    /// Sets the bookkeeping fields expected by the local store.
    pub fn prepare_for_storage(&mut self, kind: ResourceKind, revision: Option<&str>) {
        self.body.insert("_id".to_string(), Value::String(self.id.clone()));
        self.body.insert("doc_type".to_string(), Value::String(kind.doc_type().to_string()));
        self.set_revision(revision);
    }

    /// Sets or clears `_rev`.
    pub fn set_revision(&mut self, revision: Option<&str>) {
        match revision {
            Some(rev) => {
                self.body.insert("_rev".to_string(), Value::String(rev.to_string()));
            },
            None => {
                self.body.remove("_rev");
            },
        }
    }

    /// Borrows the raw JSON body.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Consumes the document into its JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

/// Parses an upstream RFC 3339 timestamp into UTC.
///
/// # Errors
///
/// Returns `CoreError::InvalidTimestamp` for malformed input.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).map(|date| date.with_timezone(&Utc)).map_err(|e| {
        CoreError::InvalidTimestamp { value: raw.to_string(), reason: e.to_string() }
    })
}
