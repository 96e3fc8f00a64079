//! Elasticsearch-backed storage adapter.
//!
//! Documents live in the `db_name` index and are read and written through
//! `alias`. Each write carries the document's modification time as an
//! external version, so the index itself rejects anything that is not newer
//! than what it holds.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use edge_core::{parse_timestamp, Clock, ResourceDocument, ResourceItemReference};
use reqwest::{header, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::{with_filter_retries, LocalCheck, SaveReport, StorageAdapter, StorageConfig};
use crate::error::{BridgeError, Result};

/// Field limit the bridge needs for deeply nested tender documents.
const TOTAL_FIELDS_LIMIT: u32 = 4000;

const TOTAL_FIELDS_SETTING: &str = "index.mapping.total_fields.limit";

const INDEX_EXISTS_ERROR: &str = "resource_already_exists_exception";

const VERSION_CONFLICT_STATUS: u16 = 409;

/// Storage adapter speaking the Elasticsearch REST API.
pub struct ElasticStorage {
    http: reqwest::Client,
    server: Url,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct MgetResponse {
    #[serde(default)]
    docs: Vec<MgetDoc>,
}

#[derive(Debug, Deserialize)]
struct MgetDoc {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_version", default)]
    version: Option<u64>,
    #[serde(rename = "_source", default)]
    source: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: String,
    status: u16,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: ErrorBody,
}

impl ElasticStorage {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if the server URL is invalid or
    /// the HTTP client cannot be built.
    pub fn new(config: StorageConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let server = Url::parse(&config.elasticsearch_url)
            .map_err(|e| BridgeError::configuration(format!("invalid elasticsearch_url: {e}")))?;
        if server.cannot_be_a_base() {
            return Err(BridgeError::configuration("elasticsearch_url cannot be a base url"));
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
            .map_err(|()| BridgeError::configuration("elasticsearch_url cannot be a base url"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| BridgeError::storage(format!("request failed: {e}")))
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        response.json::<T>().await.map_err(|e| BridgeError::storage(format!("undecodable body: {e}")))
    }

    async fn fetch_doc(&self, id: &str) -> Result<Option<GetResponse>> {
        let url = self.url(&[self.config.alias.as_str(), "_doc", id])?;
        let response = self.send(self.http.get(url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let doc: GetResponse = Self::decode(response).await?;
                Ok(doc.source.is_some().then_some(doc))
            },
            status => Err(BridgeError::storage(format!("get {id} returned HTTP {status}"))),
        }
    }

    async fn mget_dates(&self, ids: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        let url = self.url(&[self.config.alias.as_str(), "_mget"])?;
        let request =
            self.http.post(url).query(&[("_source_includes", "dateModified")]).json(&json!({ "ids": ids }));
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(BridgeError::storage(format!("mget returned HTTP {}", response.status())));
        }

        let mget: MgetResponse = Self::decode(response).await?;
        let mut dates = HashMap::with_capacity(mget.docs.len());
        for doc in mget.docs.into_iter().filter(|doc| doc.found) {
            let date = doc
                .source
                .as_ref()
                .and_then(|source| source.get("dateModified"))
                .and_then(Value::as_str)
                .map(parse_timestamp);
            match date {
                Some(Ok(date)) => {
                    dates.insert(doc.id, date);
                },
                _ => warn!(resource_id = %doc.id, "stored document has no usable dateModified"),
            }
        }
        Ok(dates)
    }

    /// Renders the newline-delimited bulk body. Storage metadata never goes
    /// into `_source`.
    fn bulk_body(&self, documents: Vec<ResourceDocument>) -> Result<String> {
        let mut body = String::new();
        for document in documents {
            let version = document.date_modified().timestamp_micros().max(0);
            let id = document.id().to_string();
            let mut source = match document.into_value() {
                Value::Object(source) => source,
                _ => return Err(BridgeError::storage(format!("document {id} is not an object"))),
            };
            source.remove("_id");
            source.remove("_rev");

            let action = json!({
                "index": {
                    "_index": self.config.alias,
                    "_id": id,
                    "version": version,
                    "version_type": "external",
                }
            });
            for line in [action, Value::Object(source)] {
                let line = serde_json::to_string(&line)
                    .map_err(|e| BridgeError::storage(format!("unencodable document {id}: {e}")))?;
                body.push_str(&line);
                body.push('\n');
            }
        }
        Ok(body)
    }

    async fn bulk_index(&self, documents: Vec<ResourceDocument>) -> Result<SaveReport> {
        let count = documents.len();
        let body = self.bulk_body(documents)?;
        let request = self
            .http
            .post(self.url(&["_bulk"])?)
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(BridgeError::storage(format!("bulk index returned HTTP {}", response.status())));
        }

        let bulk: BulkResponse = Self::decode(response).await?;
        let mut report = SaveReport::default();
        for item in bulk.items.into_iter().flat_map(HashMap::into_values) {
            match (item.status, item.error) {
                (status, None) if (200..300).contains(&status) => {
                    if item.result.as_deref() == Some("created") || status == 201 {
                        report.created.push(item.id);
                    } else {
                        report.updated.push(item.id);
                    }
                },
                (VERSION_CONFLICT_STATUS, _) => {
                    debug!(resource_id = %item.id, "ignored stale write");
                    report.skipped.push(item.id);
                },
                (status, error) => {
                    let error = error.unwrap_or_default();
                    error!(
                        resource_id = %item.id,
                        status,
                        error = %error.kind,
                        reason = %error.reason,
                        "document rejected by store"
                    );
                    report.retry.push(item.id);
                },
            }
        }
        info!(docs = count, resource = self.config.resource.singular(), "saved bulk");
        Ok(report)
    }

    async fn create_index(&self) -> Result<()> {
        let index = self.config.db_name.as_str();
        let response = self.send(self.http.put(self.url(&[index])?)).await?;
        match response.status() {
            status if status.is_success() => info!(index, "created index"),
            StatusCode::BAD_REQUEST => {
                let body: ErrorResponse = Self::decode(response).await?;
                if body.error.kind != INDEX_EXISTS_ERROR {
                    return Err(BridgeError::storage(format!(
                        "create index rejected: {}",
                        body.error.reason
                    )));
                }
                debug!(index, "index exists");
            },
            status => return Err(BridgeError::storage(format!("create index returned HTTP {status}"))),
        }
        Ok(())
    }

    async fn put_alias(&self) -> Result<()> {
        let url = self.url(&[self.config.db_name.as_str(), "_alias", self.config.alias.as_str()])?;
        let response = self.send(self.http.put(url)).await?;
        if !response.status().is_success() {
            return Err(BridgeError::storage(format!("put alias returned HTTP {}", response.status())));
        }
        debug!(index = %self.config.db_name, alias = %self.config.alias, "alias in place");
        Ok(())
    }

    async fn raise_field_limit(&self) -> Result<()> {
        let index = self.config.db_name.as_str();
        let response = self.send(self.http.get(self.url(&[index, "_settings", TOTAL_FIELDS_SETTING])?)).await?;
        if !response.status().is_success() {
            return Err(BridgeError::storage(format!("get settings returned HTTP {}", response.status())));
        }
        let settings: Value = Self::decode(response).await?;
        let current = settings
            .pointer(&format!("/{index}/settings/index/mapping/total_fields/limit"))
            .and_then(Value::as_str)
            .and_then(|limit| limit.parse::<u32>().ok());
        if current == Some(TOTAL_FIELDS_LIMIT) {
            return Ok(());
        }

        let body = json!({ "index.mapping.total_fields.limit": TOTAL_FIELDS_LIMIT });
        let response = self.send(self.http.put(self.url(&[index, "_settings"])?).json(&body)).await?;
        if !response.status().is_success() {
            return Err(BridgeError::storage(format!("put settings returned HTTP {}", response.status())));
        }
        info!(index, limit = TOTAL_FIELDS_LIMIT, "raised total fields limit");
        Ok(())
    }
}

impl StorageAdapter for ElasticStorage {
    fn check(
        &self,
        reference: ResourceItemReference,
    ) -> Pin<Box<dyn Future<Output = Result<LocalCheck>> + Send + '_>> {
        Box::pin(async move {
            let Some(stored) = self.fetch_doc(&reference.id).await? else {
                return Ok(LocalCheck::default());
            };

            let local_date = stored
                .source
                .as_ref()
                .and_then(|source| source.get("dateModified"))
                .and_then(Value::as_str)
                .and_then(|raw| parse_timestamp(raw).ok());
            let is_current = match (local_date, reference.date_modified) {
                (Some(local), Some(wanted)) => local >= wanted,
                _ => false,
            };
            Ok(LocalCheck { is_current, revision: stored.version.map(|v| v.to_string()) })
        })
    }

    fn filter(
        &self,
        ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, DateTime<Utc>>>> + Send + '_>> {
        Box::pin(async move {
            with_filter_retries(&self.config, self.clock.as_ref(), || self.mget_dates(&ids)).await
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
            self.bulk_index(documents).await
        })
    }

    fn get(
        &self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResourceDocument>>> + Send + '_>> {
        Box::pin(async move {
            let Some(GetResponse { id: stored_id, source: Some(mut source), .. }) =
                self.fetch_doc(&id).await?
            else {
                return Ok(None);
            };
            source.entry("id").or_insert(Value::String(stored_id));
            ResourceDocument::from_value(Value::Object(source))
                .map(Some)
                .map_err(|e| BridgeError::storage(format!("stored document {id} is invalid: {e}")))
        })
    }

    // Documents are searchable shortly after indexing; there is no view to
    // build.
    fn index_progress(&self) -> Pin<Box<dyn Future<Output = Result<f64>> + Send + '_>> {
        Box::pin(async move { Ok(100.0) })
    }

    fn prepare(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.create_index().await?;
            self.put_alias().await?;
            self.raise_field_limit().await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use edge_core::TestClock;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::storage::StorageBackend;

    fn storage(server: &MockServer) -> (TestClock, ElasticStorage) {
        let clock = TestClock::new();
        let config = StorageConfig {
            backend: StorageBackend::Elasticsearch,
            elasticsearch_url: server.uri(),
            ..Default::default()
        };
        let storage = ElasticStorage::new(config, Arc::new(clock.clone())).unwrap();
        (clock, storage)
    }

    fn document(id: &str, date: &str) -> ResourceDocument {
        ResourceDocument::from_value(json!({"id": id, "dateModified": date})).unwrap()
    }

    #[tokio::test]
    async fn prepare_creates_alias_and_raises_field_limit() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/edge_db"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"type": "resource_already_exists_exception", "reason": "index [edge_db] already exists"},
                "status": 400
            })))
            .mount(&server)
            .await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/edge_db/_alias/bridge"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/edge_db/_settings/index.mapping.total_fields.limit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/edge_db/_settings"))
            .and(matchers::body_json(json!({"index.mapping.total_fields.limit": 4000})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;
        let (_, storage) = storage(&server);

        storage.prepare().await.unwrap();
    }

    #[tokio::test]
    async fn prepare_fails_on_unexpected_index_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/edge_db"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"type": "invalid_index_name_exception", "reason": "bad name"}
            })))
            .mount(&server)
            .await;
        let (_, storage) = storage(&server);

        assert!(matches!(storage.prepare().await, Err(BridgeError::Storage { .. })));
    }

    #[tokio::test]
    async fn filter_returns_found_dates() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/bridge/_mget"))
            .and(matchers::query_param("_source_includes", "dateModified"))
            .and(matchers::body_json(json!({"ids": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "docs": [
                    {"_id": "a", "found": true, "_version": 3, "_source": {"dateModified": "2017-01-01T00:00:00+02:00"}},
                    {"_id": "b", "found": false}
                ]
            })))
            .mount(&server)
            .await;
        let (_, storage) = storage(&server);

        let dates = storage.filter(vec!["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(dates.len(), 1);
        assert_eq!(dates["a"].to_rfc3339(), "2016-12-31T22:00:00+00:00");
    }

    #[tokio::test]
    async fn filter_retries_with_backoff_then_fails() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/bridge/_mget"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let (clock, storage) = storage(&server);

        let result = storage.filter(vec!["a".to_string()]).await;
        assert!(matches!(result, Err(BridgeError::Storage { .. })));
        assert!(clock.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn save_versions_by_date_and_classifies_items() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/_bulk"))
            .and(matchers::header("content-type", "application/x-ndjson"))
            .and(matchers::body_string_contains(r#""version_type":"external""#))
            .and(matchers::body_string_contains(r#""version":1483228800000000"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "took": 3,
                "errors": true,
                "items": [
                    {"index": {"_id": "a", "status": 201, "result": "created", "_version": 1}},
                    {"index": {"_id": "b", "status": 200, "result": "updated", "_version": 2}},
                    {"index": {"_id": "c", "status": 409, "error": {"type": "version_conflict_engine_exception", "reason": "current version is higher"}}},
                    {"index": {"_id": "d", "status": 400, "error": {"type": "mapper_parsing_exception", "reason": "failed to parse"}}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (_, storage) = storage(&server);

        let mut first = document("a", "2017-01-01T00:00:00Z");
        first.prepare_for_storage(edge_core::ResourceKind::Tenders, Some("1"));
        let docs = vec![
            first,
            document("b", "2017-01-02T00:00:00Z"),
            document("c", "2017-01-03T00:00:00Z"),
            document("d", "2017-01-04T00:00:00Z"),
        ];
        let report = storage.save(docs).await.unwrap();

        assert_eq!(report.created, vec!["a"]);
        assert_eq!(report.updated, vec!["b"]);
        assert_eq!(report.skipped, vec!["c"]);
        assert_eq!(report.retry, vec!["d"]);
    }

    #[test]
    fn bulk_body_strips_storage_metadata() {
        let config = StorageConfig { elasticsearch_url: "http://127.0.0.1:9200".into(), ..Default::default() };
        let storage = ElasticStorage::new(config, Arc::new(TestClock::new())).unwrap();
        let mut doc = document("a", "2017-01-01T00:00:00Z");
        doc.prepare_for_storage(edge_core::ResourceKind::Tenders, Some("7"));

        let body = storage.bulk_body(vec![doc]).unwrap();
        let lines: Vec<Value> = body.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["index"]["_id"], "a");
        assert_eq!(lines[0]["index"]["_index"], "bridge");
        assert!(lines[1].get("_id").is_none());
        assert!(lines[1].get("_rev").is_none());
        assert_eq!(lines[1]["dateModified"], "2017-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn get_and_check_read_source_and_version() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/bridge/_doc/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_index": "edge_db",
                "_id": "abc",
                "_version": 5,
                "found": true,
                "_source": {"dateModified": "2017-01-02T00:00:00Z", "title": "t"}
            })))
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/bridge/_doc/zzz"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"_id": "zzz", "found": false})))
            .mount(&server)
            .await;
        let (_, storage) = storage(&server);

        let doc = storage.get("abc".to_string()).await.unwrap().unwrap();
        assert_eq!(doc.id(), "abc");
        assert_eq!(doc.body()["title"], "t");
        assert!(storage.get("zzz".to_string()).await.unwrap().is_none());

        let older = ResourceItemReference::new("abc", parse_timestamp("2017-01-01T00:00:00Z").unwrap());
        let check = storage.check(older).await.unwrap();
        assert!(check.is_current);
        assert_eq!(check.revision.as_deref(), Some("5"));

        let newer = ResourceItemReference::new("abc", parse_timestamp("2017-01-03T00:00:00Z").unwrap());
        assert!(!storage.check(newer).await.unwrap().is_current);
        assert_eq!(storage.index_progress().await.unwrap(), 100.0);
    }
}
