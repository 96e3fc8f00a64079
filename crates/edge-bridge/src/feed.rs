//! Change feed of `(id, dateModified)` pairs.
//!
//! The upstream feed is read in two directions. The backward walk pages
//! through history newest first until it runs out; the forward walk starts
//! where the first response began and follows new changes as they appear.
//! [`HttpChangeFeed`] interleaves the two so neither starves the other.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edge_core::{parse_timestamp, Clock, FeedDirection, ResourceItemReference};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    client::{ApiClient, ClientConfig, FeedPage, FeedQuery},
    error::Result,
    queue::lock,
};

/// Progress state of one feed direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    /// Not requested yet.
    #[default]
    Pending,
    /// Returning items.
    Running,
    /// Caught up; waiting for new changes.
    Idle,
    /// Reached the end of history.
    Finished,
}

/// Progress of one feed direction, reported in stats snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedInfo {
    /// When the last page arrived.
    pub last_response: Option<DateTime<Utc>>,
    /// Items read so far.
    pub resource_item_count: u64,
    /// Current state.
    pub status: FeedStatus,
}

/// Reference read from the feed, tagged with its direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    /// Changed item.
    pub reference: ResourceItemReference,
    /// Direction it was read from.
    pub direction: FeedDirection,
}

impl FeedItem {
    /// Creates a feed item.
    pub fn new(reference: ResourceItemReference, direction: FeedDirection) -> Self {
        Self { reference, direction }
    }
}

/// Source of changed references.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Reads the next batch. An empty batch means the feed is caught up.
    async fn next_batch(&self) -> Result<Vec<FeedItem>>;

    /// Forward direction progress.
    fn forward_info(&self) -> FeedInfo;

    /// Backward direction progress.
    fn backward_info(&self) -> FeedInfo;
}

/// Feed settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Upstream session settings.
    pub client: ClientConfig,
    /// User agent for the feed session.
    pub user_agent: String,
    /// `mode` query parameter.
    pub retrieve_mode: String,
    /// Page size.
    pub limit: usize,
}

#[derive(Debug, Default)]
struct FeedState {
    started: bool,
    forward_offset: Option<String>,
    backward_offset: Option<String>,
    backward_done: bool,
    next_turn_backward: bool,
    forward: FeedInfo,
    backward: FeedInfo,
}

/// Change feed paging through the upstream listing API.
pub struct HttpChangeFeed {
    client: ApiClient,
    config: FeedConfig,
    state: Mutex<FeedState>,
    clock: Arc<dyn Clock>,
}

impl HttpChangeFeed {
    /// Creates the feed session.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Configuration` for a malformed host.
    pub fn new(config: FeedConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = ApiClient::new(&config.client, config.user_agent.clone())?;
        Ok(Self { client, config, state: Mutex::new(FeedState::default()), clock })
    }

    fn query(&self, offset: Option<String>, descending: bool) -> FeedQuery {
        FeedQuery {
            offset,
            limit: self.config.limit,
            mode: self.config.retrieve_mode.clone(),
            descending,
        }
    }

    async fn read_backward(&self) -> Result<Vec<FeedItem>> {
        let (first, offset) = {
            let state = lock(&self.state);
            (!state.started, state.backward_offset.clone())
        };
        let page = self.client.get_feed_page(&self.query(offset, true)).await?;
        let now = self.clock.now_utc();
        let items = page_items(&page, FeedDirection::Backward);

        let mut state = lock(&self.state);
        if first {
            state.started = true;
            state.forward_offset = page.prev_page.as_ref().map(|cursor| cursor.as_param());
            state.forward.status = FeedStatus::Running;
            info!(offset = ?state.forward_offset, "forward feed anchored");
        }
        state.backward.last_response = Some(now);
        state.backward.resource_item_count += items.len() as u64;
        if items.is_empty() {
            state.backward_done = true;
            state.backward.status = FeedStatus::Finished;
            info!(
                resource_item_count = state.backward.resource_item_count,
                "backward feed finished"
            );
        } else {
            state.backward.status = FeedStatus::Running;
            state.backward_offset = page.next_page.as_ref().map(|cursor| cursor.as_param());
        }
        Ok(items)
    }

    async fn read_forward(&self) -> Result<Vec<FeedItem>> {
        let offset = lock(&self.state).forward_offset.clone();
        let page = self.client.get_feed_page(&self.query(offset, false)).await?;
        let now = self.clock.now_utc();
        let items = page_items(&page, FeedDirection::Forward);

        let mut state = lock(&self.state);
        state.forward.last_response = Some(now);
        state.forward.resource_item_count += items.len() as u64;
        state.forward.status = if items.is_empty() { FeedStatus::Idle } else { FeedStatus::Running };
        if let Some(cursor) = page.next_page.as_ref() {
            state.forward_offset = Some(cursor.as_param());
        }
        Ok(items)
    }
}

fn page_items(page: &FeedPage, direction: FeedDirection) -> Vec<FeedItem> {
    page.data
        .iter()
        .filter_map(|item| match parse_timestamp(&item.date_modified) {
            Ok(date) => Some(FeedItem::new(ResourceItemReference::new(item.id.clone(), date), direction)),
            Err(e) => {
                warn!(resource_id = %item.id, error = %e, "skipping feed item with bad dateModified");
                None
            },
        })
        .collect()
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn next_batch(&self) -> Result<Vec<FeedItem>> {
        let (started, backward_done, backward_turn) = {
            let state = lock(&self.state);
            (state.started, state.backward_done, state.next_turn_backward)
        };

        if !started {
            return self.read_backward().await;
        }

        let backward_first = backward_turn && !backward_done;
        lock(&self.state).next_turn_backward = !backward_first;

        let items = if backward_first { self.read_backward().await? } else { self.read_forward().await? };
        if !items.is_empty() {
            return Ok(items);
        }

        // Fall through to the other direction so an idle forward walk does not
        // stall the backfill.
        let backward_available = !lock(&self.state).backward_done;
        if backward_first {
            self.read_forward().await
        } else if backward_available {
            self.read_backward().await
        } else {
            debug!("feed caught up");
            Ok(Vec::new())
        }
    }

    fn forward_info(&self) -> FeedInfo {
        lock(&self.state).forward.clone()
    }

    fn backward_info(&self) -> FeedInfo {
        lock(&self.state).backward.clone()
    }
}

pub mod mock {
    //! Scripted feed for tests.

    use std::collections::VecDeque;

    use super::*;
    use crate::error::BridgeError;

    /// Feed that replays pre-recorded batches, then reports caught up.
    #[derive(Default)]
    pub struct StaticFeed {
        batches: Mutex<VecDeque<Result<Vec<FeedItem>>>>,
        forward: Mutex<FeedInfo>,
        backward: Mutex<FeedInfo>,
        calls: Mutex<usize>,
    }

    impl StaticFeed {
        /// Creates a feed replaying `batches` in order.
        pub fn new(batches: Vec<Vec<FeedItem>>) -> Self {
            let feed = Self::default();
            lock(&feed.batches).extend(batches.into_iter().map(Ok));
            feed
        }

        /// Creates a feed replaying one backward batch of `references`.
        pub fn backward(references: Vec<ResourceItemReference>) -> Self {
            let items = references
                .into_iter()
                .map(|reference| FeedItem::new(reference, FeedDirection::Backward))
                .collect();
            Self::new(vec![items])
        }

        /// Appends a batch.
        pub fn push_batch(&self, batch: Vec<FeedItem>) {
            lock(&self.batches).push_back(Ok(batch));
        }

        /// Appends a transport failure.
        pub fn push_error(&self, message: impl Into<String>) {
            lock(&self.batches).push_back(Err(BridgeError::transport(message)));
        }

        /// Number of `next_batch` calls so far.
        pub fn calls(&self) -> usize {
            *lock(&self.calls)
        }
    }

    #[async_trait]
    impl ChangeFeed for StaticFeed {
        async fn next_batch(&self) -> Result<Vec<FeedItem>> {
            *lock(&self.calls) += 1;
            let next = lock(&self.batches).pop_front();
            match next {
                Some(Ok(batch)) => {
                    for item in &batch {
                        let mut info = match item.direction {
                            FeedDirection::Forward => lock(&self.forward),
                            FeedDirection::Backward => lock(&self.backward),
                        };
                        info.resource_item_count += 1;
                        info.status = FeedStatus::Running;
                    }
                    Ok(batch)
                },
                Some(Err(e)) => Err(e),
                None => {
                    lock(&self.forward).status = FeedStatus::Idle;
                    Ok(Vec::new())
                },
            }
        }

        fn forward_info(&self) -> FeedInfo {
            lock(&self.forward).clone()
        }

        fn backward_info(&self) -> FeedInfo {
            lock(&self.backward).clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use edge_core::TestClock;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn feed(server: &MockServer) -> HttpChangeFeed {
        let config = FeedConfig {
            client: ClientConfig {
                host: server.uri(),
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
            user_agent: "edge.test/feed".to_string(),
            retrieve_mode: "_all_".to_string(),
            limit: 100,
        };
        HttpChangeFeed::new(config, Arc::new(TestClock::new())).unwrap()
    }

    fn page(ids: &[&str], next: &str, prev: &str) -> serde_json::Value {
        let data: Vec<_> = ids
            .iter()
            .map(|id| json!({"id": id, "dateModified": "2017-01-01T00:00:00Z"}))
            .collect();
        json!({"data": data, "next_page": {"offset": next}, "prev_page": {"offset": prev}})
    }

    #[tokio::test]
    async fn walks_backward_then_follows_forward() {
        let server = MockServer::start().await;
        // first backward page, no offset
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/2.5/tenders"))
            .and(matchers::query_param("descending", "1"))
            .and(matchers::query_param_is_missing("offset"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(&["b1", "b2"], "b-next", "f-start")))
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/2.5/tenders"))
            .and(matchers::query_param("descending", "1"))
            .and(matchers::query_param("offset", "b-next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(&[], "b-end", "x")))
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/2.5/tenders"))
            .and(matchers::query_param("offset", "f-start"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(&["f1"], "f-next", "x")))
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/2.5/tenders"))
            .and(matchers::query_param("offset", "f-next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(&[], "f-next", "x")))
            .mount(&server)
            .await;

        let feed = feed(&server);

        let first = feed.next_batch().await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|item| item.direction == FeedDirection::Backward));

        let second = feed.next_batch().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].direction, FeedDirection::Forward);
        assert_eq!(second[0].reference.id, "f1");

        // backward page is empty, falls through to an empty forward page
        let third = feed.next_batch().await.unwrap();
        assert!(third.is_empty());
        assert_eq!(feed.backward_info().status, FeedStatus::Finished);
        assert_eq!(feed.backward_info().resource_item_count, 2);
        assert_eq!(feed.forward_info().status, FeedStatus::Idle);
        assert_eq!(feed.forward_info().resource_item_count, 1);
    }

    #[tokio::test]
    async fn static_feed_replays_then_idles() {
        let feed = mock::StaticFeed::backward(vec![ResourceItemReference::unresolved("a")]);
        feed.push_error("boom");

        assert_eq!(feed.next_batch().await.unwrap().len(), 1);
        assert!(feed.next_batch().await.is_err());
        assert!(feed.next_batch().await.unwrap().is_empty());
        assert_eq!(feed.calls(), 3);
        assert_eq!(feed.backward_info().resource_item_count, 1);
        assert_eq!(feed.forward_info().status, FeedStatus::Idle);
    }
}
