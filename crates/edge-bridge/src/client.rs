//! HTTP client for the upstream resources API.
//!
//! One [`ApiClient`] is one upstream session: a reqwest client with its own
//! cookie jar and user agent. Responses are mapped onto the bridge error
//! taxonomy so workers can route failures without looking at raw status
//! codes.

use std::time::Duration;

use edge_core::{ResourceDocument, ResourceKind};
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{BridgeError, Result};

/// Configuration shared by every upstream session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upstream host, e.g. `https://public.api.openprocurement.org`.
    pub host: String,
    /// API version path segment.
    pub api_version: String,
    /// Replicated resource collection.
    pub resource: ResourceKind,
    /// Base user agent; sessions append their own identifiers.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:6543".to_string(),
            api_version: "2.5".to_string(),
            resource: ResourceKind::Tenders,
            user_agent: "edge.multi".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Query parameters for one change feed page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedQuery {
    /// Paging offset returned by a previous page.
    pub offset: Option<String>,
    /// Page size.
    pub limit: usize,
    /// Feed mode, e.g. `_all_`.
    pub mode: String,
    /// Walk the feed newest first.
    pub descending: bool,
}

/// One page of the upstream change feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedPage {
    /// Changed items on this page.
    #[serde(default)]
    pub data: Vec<FeedPageItem>,
    /// Cursor for the page after this one.
    pub next_page: Option<PageCursor>,
    /// Cursor for the page before this one.
    pub prev_page: Option<PageCursor>,
}

/// Item listed on a change feed page.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedPageItem {
    /// Resource identifier.
    pub id: String,
    /// Last modification, RFC 3339.
    #[serde(rename = "dateModified")]
    pub date_modified: String,
}

/// Paging cursor; upstream sends either a string or a number.
#[derive(Debug, Clone, Deserialize)]
pub struct PageCursor {
    /// Raw offset value.
    pub offset: Value,
}

impl PageCursor {
    /// Offset rendered as a query parameter.
    pub fn as_param(&self) -> String {
        match &self.offset {
            Value::String(offset) => offset.clone(),
            other => other.to_string(),
        }
    }
}

/// Single upstream session.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    api_root: Url,
    resource: ResourceKind,
    user_agent: String,
    timeout: Duration,
}

impl ApiClient {
    /// Creates a session for `config` identified by `user_agent`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if the host is not an absolute
    /// http(s) URL or the HTTP client cannot be built.
    pub fn new(config: &ClientConfig, user_agent: impl Into<String>) -> Result<Self> {
        let api_root = api_root(&config.host, &config.api_version)?;
        let user_agent = user_agent.into();
        let http = build_http(&user_agent, config.timeout)?;

        Ok(Self { http, api_root, resource: config.resource, user_agent, timeout: config.timeout })
    }

    /// User agent this session identifies with.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Requests the `spore` endpoint so the server assigns session cookies.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the host cannot be reached, and the
    /// same status classification as [`ApiClient::get_resource_item`] if the
    /// server refuses the session.
    pub async fn establish_session(&self) -> Result<()> {
        let url = self.url_for(&["spore"])?;
        let response = self.http.head(url).send().await.map_err(|e| self.map_send_error(e))?;
        let response = check_status(response, "spore")?;
        debug!(
            user_agent = %self.user_agent,
            status = response.status().as_u16(),
            "session established"
        );
        Ok(())
    }

    /// Replaces the session with a fresh cookie jar.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` if the HTTP client cannot be
    /// rebuilt.
    pub fn clear_cookies(&mut self) -> Result<()> {
        self.http = build_http(&self.user_agent, self.timeout)?;
        Ok(())
    }

    /// Fetches the full document for `id`.
    ///
    /// # Errors
    ///
    /// - `RateLimited` for HTTP 429
    /// - `NotFound` for HTTP 404 and 410
    /// - `UnexpectedStatus` for any other non-success status
    /// - `InvalidResponse` if the body is not `{"data": {...}}` with an id
    ///   and `dateModified`
    /// - `Transport` or `Timeout` for network failures
    pub async fn get_resource_item(&self, id: &str) -> Result<ResourceDocument> {
        let span = info_span!(
            "resource_fetch",
            resource = %self.resource,
            resource_id = %id,
            user_agent = %self.user_agent
        );

        async move {
            let url = self.url_for(&[self.resource.as_str(), id])?;
            let response =
                self.http.get(url).send().await.map_err(|e| self.map_send_error(e))?;
            let response = check_status(response, id)?;

            let mut body: Value = response
                .json()
                .await
                .map_err(|e| BridgeError::invalid_response(format!("undecodable body: {e}")))?;
            let data = body
                .get_mut("data")
                .map(Value::take)
                .ok_or_else(|| BridgeError::invalid_response("response lacks data"))?;

            let document = ResourceDocument::from_value(data)?;
            debug!(date_modified = %document.date_modified(), "received document");
            Ok(document)
        }
        .instrument(span)
        .await
    }

    /// Fetches one page of the change feed.
    ///
    /// # Errors
    ///
    /// Same classification as [`ApiClient::get_resource_item`].
    pub async fn get_feed_page(&self, query: &FeedQuery) -> Result<FeedPage> {
        let mut url = self.url_for(&[self.resource.as_str()])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("mode", &query.mode);
            pairs.append_pair("limit", &query.limit.to_string());
            if query.descending {
                pairs.append_pair("descending", "1");
            }
            if let Some(offset) = &query.offset {
                pairs.append_pair("offset", offset);
            }
        }

        let response = self.http.get(url).send().await.map_err(|e| self.map_send_error(e))?;
        let response = check_status(response, self.resource.as_str())?;
        response
            .json::<FeedPage>()
            .await
            .map_err(|e| BridgeError::invalid_response(format!("undecodable feed page: {e}")))
    }

    fn url_for(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_root.clone();
        url.path_segments_mut()
            .map_err(|()| BridgeError::configuration("api host cannot be a base url"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn map_send_error(&self, error: reqwest::Error) -> BridgeError {
        warn!(user_agent = %self.user_agent, error = %error, "request failed");
        if error.is_timeout() {
            return BridgeError::timeout(self.timeout.as_secs());
        }
        if error.is_connect() {
            return BridgeError::transport(format!("connection failed: {error}"));
        }
        BridgeError::transport(error.to_string())
    }
}

fn api_root(host: &str, api_version: &str) -> Result<Url> {
    let host_url = Url::parse(host)
        .map_err(|e| BridgeError::configuration(format!("invalid api host {host:?}: {e}")))?;
    if !matches!(host_url.scheme(), "http" | "https") || host_url.host_str().is_none() {
        return Err(BridgeError::configuration(format!(
            "invalid api host {host:?}: expected an http(s) url"
        )));
    }

    let root = format!("{}/api/{}", host.trim_end_matches('/'), api_version);
    Url::parse(&root)
        .map_err(|e| BridgeError::configuration(format!("invalid api root {root:?}: {e}")))
}

fn build_http(user_agent: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .cookie_store(true)
        .build()
        .map_err(|e| BridgeError::configuration(format!("failed to build HTTP client: {e}")))
}

fn check_status(response: Response, resource_id: &str) -> Result<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::TOO_MANY_REQUESTS => Err(BridgeError::RateLimited),
        status @ (StatusCode::NOT_FOUND | StatusCode::GONE) => {
            Err(BridgeError::not_found(resource_id, status.as_u16()))
        },
        status => Err(BridgeError::unexpected_status(status.as_u16())),
    }
}
