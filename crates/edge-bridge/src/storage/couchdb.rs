//! CouchDB-backed storage adapter.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use edge_core::{parse_timestamp, Clock, ResourceDocument, ResourceItemReference};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{
    with_filter_retries, LocalCheck, SaveReport, StorageAdapter, StorageConfig, STALE_WRITE_REASON,
};
use crate::error::{BridgeError, Result};

const VIEW_NAME: &str = "by_dateModified";

/// Storage adapter speaking the CouchDB HTTP API.
pub struct CouchStorage {
    http: reqwest::Client,
    server: Url,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct ViewResponse {
    #[serde(default)]
    rows: Vec<ViewRow>,
}

#[derive(Debug, Deserialize)]
struct ViewRow {
    id: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct BulkResult {
    id: String,
    rev: Option<String>,
    error: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActiveTask {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    database: String,
    #[serde(default)]
    design_document: String,
    #[serde(default)]
    progress: f64,
}

impl CouchStorage {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if the server URL is invalid or
    /// the HTTP client cannot be built.
    pub fn new(config: StorageConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let server = Url::parse(&config.couch_url)
            .map_err(|e| BridgeError::configuration(format!("invalid couch_url: {e}")))?;
        if server.cannot_be_a_base() {
            return Err(BridgeError::configuration("couch_url cannot be a base url"));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BridgeError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, server, config, clock })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.server.clone();
        url.path_segments_mut()
            .map_err(|()| BridgeError::configuration("couch_url cannot be a base url"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn db_url(&self, segments: &[&str]) -> Result<Url> {
        let mut all = Vec::with_capacity(segments.len() + 1);
        all.push(self.config.db_name.as_str());
        all.extend_from_slice(segments);
        self.url(&all)
    }

    fn design_id(&self) -> String {
        format!("_design/{}", self.config.resource)
    }

    fn design_document(&self) -> Value {
        let doc_type = self.config.resource.doc_type();
        json!({
            "_id": self.design_id(),
            "language": "javascript",
            "views": {
                "by_dateModified": {
                    "map": format!(
                        "function(doc) {{ if (doc.doc_type == '{doc_type}') {{ emit(doc._id, doc.dateModified); }} }}"
                    ),
                },
            },
            "validate_doc_update": format!(
                "function(newDoc, oldDoc, userCtx) {{ if (oldDoc && !newDoc._deleted && Date.parse(newDoc.dateModified) <= Date.parse(oldDoc.dateModified)) {{ throw({{forbidden: '{STALE_WRITE_REASON}'}}); }} }}"
            ),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| BridgeError::storage(format!("request failed: {e}")))
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        response.json::<T>().await.map_err(|e| BridgeError::storage(format!("undecodable body: {e}")))
    }

    async fn fetch_doc(&self, segments: &[&str]) -> Result<Option<Value>> {
        let response = self.send(self.http.get(self.db_url(segments)?)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Self::decode(response).await.map(Some),
            status => Err(BridgeError::storage(format!(
                "get {} returned HTTP {status}",
                segments.join("/")
            ))),
        }
    }

    async fn query_view(&self, ids: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        let design = self.config.resource.as_str();
        let url = self.db_url(&["_design", design, "_view", VIEW_NAME])?;
        let response = self.send(self.http.post(url).json(&json!({ "keys": ids }))).await?;
        if !response.status().is_success() {
            return Err(BridgeError::storage(format!("view query returned HTTP {}", response.status())));
        }

        let view: ViewResponse = Self::decode(response).await?;
        let mut dates = HashMap::with_capacity(view.rows.len());
        for row in view.rows {
            match row.value.as_str().map(parse_timestamp) {
                Some(Ok(date)) => {
                    dates.insert(row.id, date);
                },
                _ => warn!(resource_id = %row.id, "stored document has no usable dateModified"),
            }
        }
        Ok(dates)
    }

    async fn bulk_docs(&self, documents: Vec<ResourceDocument>) -> Result<SaveReport> {
        let count = documents.len();
        let docs: Vec<Value> = documents.into_iter().map(ResourceDocument::into_value).collect();
        let url = self.db_url(&["_bulk_docs"])?;
        let response = self.send(self.http.post(url).json(&json!({ "docs": docs }))).await?;
        if !response.status().is_success() {
            return Err(BridgeError::storage(format!("bulk save returned HTTP {}", response.status())));
        }

        let results: Vec<BulkResult> = Self::decode(response).await?;
        let mut report = SaveReport::default();
        for result in results {
            match (result.rev, result.reason) {
                (Some(rev), _) if result.error.is_none() => {
                    if rev.starts_with("1-") {
                        report.created.push(result.id);
                    } else {
                        report.updated.push(result.id);
                    }
                },
                (_, Some(reason)) if reason == STALE_WRITE_REASON => {
                    debug!(resource_id = %result.id, reason = %reason, "ignored stale write");
                    report.skipped.push(result.id);
                },
                (_, reason) => {
                    error!(
                        resource_id = %result.id,
                        error = result.error.as_deref().unwrap_or("unknown"),
                        reason = reason.as_deref().unwrap_or(""),
                        "document rejected by store"
                    );
                    report.retry.push(result.id);
                },
            }
        }
        info!(docs = count, resource = self.config.resource.singular(), "saved bulk");
        Ok(report)
    }
}

impl StorageAdapter for CouchStorage {
    fn check(
        &self,
        reference: ResourceItemReference,
    ) -> Pin<Box<dyn Future<Output = Result<LocalCheck>> + Send + '_>> {
        Box::pin(async move {
            let Some(stored) = self.fetch_doc(&[reference.id.as_str()]).await? else {
                return Ok(LocalCheck::default());
            };

            let revision = stored.get("_rev").and_then(Value::as_str).map(str::to_string);
            let local_date =
                stored.get("dateModified").and_then(Value::as_str).and_then(|raw| parse_timestamp(raw).ok());
            let is_current = match (local_date, reference.date_modified) {
                (Some(local), Some(wanted)) => local >= wanted,
                _ => false,
            };
            Ok(LocalCheck { is_current, revision })
        })
    }

    fn filter(
        &self,
        ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, DateTime<Utc>>>> + Send + '_>> {
        Box::pin(async move {
            with_filter_retries(&self.config, self.clock.as_ref(), || self.query_view(&ids)).await
        })
    }

    fn save(
        &self,
        documents: Vec<ResourceDocument>,
    ) -> Pin<Box<dyn Future<Output = Result<SaveReport>> + Send + '_>> {
        Box::pin(async move {
            if documents.is_empty() {
                return Ok(SaveReport::default());
            }
            self.bulk_docs(documents).await
        })
    }

    fn get(
        &self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResourceDocument>>> + Send + '_>> {
        Box::pin(async move {
            let Some(stored) = self.fetch_doc(&[id.as_str()]).await? else {
                return Ok(None);
            };
            ResourceDocument::from_value(stored)
                .map(Some)
                .map_err(|e| BridgeError::storage(format!("stored document {id} is invalid: {e}")))
        })
    }

    fn index_progress(&self) -> Pin<Box<dyn Future<Output = Result<f64>> + Send + '_>> {
        Box::pin(async move {
            let response = self.send(self.http.get(self.url(&["_active_tasks"])?)).await?;
            if !response.status().is_success() {
                return Err(BridgeError::storage(format!(
                    "active tasks returned HTTP {}",
                    response.status()
                )));
            }
            let tasks: Vec<ActiveTask> = Self::decode(response).await?;
            let design_id = self.design_id();

            // Clustered databases report shard paths like `shards/00-1f/edge_db.1490`.
            let progress = tasks
                .iter()
                .filter(|task| task.kind == "indexer" && task.design_document == design_id)
                .filter(|task| {
                    task.database == self.config.db_name
                        || task.database.contains(&format!("/{}.", self.config.db_name))
                })
                .map(|task| task.progress)
                .fold(None, |lowest: Option<f64>, p| Some(lowest.map_or(p, |l| l.min(p))));
            Ok(progress.unwrap_or(100.0))
        })
    }

    fn prepare(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let response = self.send(self.http.put(self.db_url(&[])?)).await?;
            match response.status() {
                StatusCode::PRECONDITION_FAILED => debug!(db = %self.config.db_name, "database exists"),
                status if status.is_success() => info!(db = %self.config.db_name, "created database"),
                status => {
                    return Err(BridgeError::storage(format!("create database returned HTTP {status}")));
                },
            }

            let design_id = self.design_id();
            let mut design = self.design_document();
            let design_path = ["_design", self.config.resource.as_str()];
            if let Some(existing) = self.fetch_doc(&design_path).await? {
                if let Some(rev) = existing.get("_rev").cloned() {
                    design["_rev"] = rev;
                }
            }

            let response = self.send(self.http.put(self.db_url(&design_path)?).json(&design)).await?;
            if !response.status().is_success() {
                return Err(BridgeError::storage(format!(
                    "design document upload returned HTTP {}",
                    response.status()
                )));
            }
            info!(design = %design_id, "synced design document");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use edge_core::TestClock;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn storage(server: &MockServer) -> (TestClock, CouchStorage) {
        let clock = TestClock::new();
        let config = StorageConfig { couch_url: server.uri(), ..Default::default() };
        let storage = CouchStorage::new(config, Arc::new(clock.clone())).unwrap();
        (clock, storage)
    }

    #[tokio::test]
    async fn check_compares_local_date() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/edge_db/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"_id": "abc", "_rev": "2-x", "dateModified": "2017-01-02T00:00:00Z"}),
            ))
            .mount(&server)
            .await;
        let (_, storage) = storage(&server).await;

        let older = ResourceItemReference::new("abc", parse_timestamp("2017-01-01T00:00:00Z").unwrap());
        let newer = ResourceItemReference::new("abc", parse_timestamp("2017-01-03T00:00:00Z").unwrap());

        let check = storage.check(older).await.unwrap();
        assert!(check.is_current);
        let check = storage.check(newer).await.unwrap();
        assert!(!check.is_current);
        assert_eq!(check.revision.as_deref(), Some("2-x"));

        let missing = storage.check(ResourceItemReference::unresolved("zzz")).await.unwrap();
        assert_eq!(missing, LocalCheck::default());
    }

    #[tokio::test]
    async fn save_classifies_bulk_results() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/edge_db/_bulk_docs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                {"id": "a", "rev": "1-aaa"},
                {"id": "b", "rev": "3-bbb"},
                {"id": "c", "error": "forbidden", "reason": STALE_WRITE_REASON},
                {"id": "d", "error": "conflict", "reason": "Document update conflict."}
            ])))
            .mount(&server)
            .await;
        let (_, storage) = storage(&server).await;

        let docs = ["a", "b", "c", "d"]
            .iter()
            .map(|id| {
                ResourceDocument::from_value(json!({"id": id, "dateModified": "2017-01-01T00:00:00Z"}))
                    .unwrap()
            })
            .collect();
        let report = storage.save(docs).await.unwrap();

        assert_eq!(report.created, vec!["a"]);
        assert_eq!(report.updated, vec!["b"]);
        assert_eq!(report.skipped, vec!["c"]);
        assert_eq!(report.retry, vec!["d"]);
    }

    #[tokio::test]
    async fn filter_retries_with_backoff_then_fails() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/edge_db/_design/tenders/_view/by_dateModified"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;
        let (clock, storage) = storage(&server).await;

        let result = storage.filter(vec!["a".to_string()]).await;
        assert!(matches!(result, Err(BridgeError::Storage { .. })));
        assert!(clock.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn filter_returns_local_dates() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/edge_db/_design/tenders/_view/by_dateModified"))
            .and(matchers::body_json(json!({"keys": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_rows": 1,
                "rows": [{"id": "a", "key": "a", "value": "2017-01-01T00:00:00+02:00"}]
            })))
            .mount(&server)
            .await;
        let (_, storage) = storage(&server).await;

        let dates = storage.filter(vec!["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(dates.len(), 1);
        assert_eq!(dates["a"].to_rfc3339(), "2016-12-31T22:00:00+00:00");
    }

    #[tokio::test]
    async fn index_progress_reads_indexer_tasks() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/_active_tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"type": "indexer", "database": "shards/00-1f/edge_db.1490", "design_document": "_design/tenders", "progress": 40},
                {"type": "indexer", "database": "other_db", "design_document": "_design/tenders", "progress": 5},
                {"type": "replication", "database": "edge_db", "progress": 1}
            ])))
            .mount(&server)
            .await;
        let (_, storage) = storage(&server).await;

        assert_eq!(storage.index_progress().await.unwrap(), 40.0);
    }

    #[tokio::test]
    async fn prepare_tolerates_existing_database() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/edge_db"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/edge_db/_design/tenders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_id": "_design/tenders", "_rev": "4-d"})))
            .mount(&server)
            .await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/edge_db/_design/tenders"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;
        let (_, storage) = storage(&server).await;

        storage.prepare().await.unwrap();
    }

    #[tokio::test]
    async fn prepare_fails_when_store_rejects() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/edge_db"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let (_, storage) = storage(&server).await;

        assert!(matches!(storage.prepare().await, Err(BridgeError::Storage { .. })));
    }
}
