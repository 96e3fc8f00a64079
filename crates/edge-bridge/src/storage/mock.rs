//! In-memory storage for tests.
//!
//! Enforces the same monotonic write rule as the production design document:
//! a document that is not newer than the stored one is skipped. Failures can
//! be injected per operation.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use edge_core::{ResourceDocument, ResourceItemReference};
use tokio::sync::RwLock;

use super::{LocalCheck, SaveReport, StorageAdapter};
use crate::error::{BridgeError, Result};

/// Mock storage backed by a hash map.
#[derive(Clone)]
pub struct MockStorage {
    documents: Arc<RwLock<HashMap<String, ResourceDocument>>>,
    revisions: Arc<RwLock<HashMap<String, u64>>>,
    check_error: Arc<RwLock<Option<String>>>,
    filter_error: Arc<RwLock<Option<String>>>,
    save_error: Arc<RwLock<Option<String>>>,
    save_rejections: Arc<RwLock<Vec<String>>>,
    progress: Arc<RwLock<f64>>,
    save_calls: Arc<RwLock<Vec<Vec<String>>>>,
}

impl MockStorage {
    /// Creates an empty store with a fully built index.
    pub fn new() -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            revisions: Arc::new(RwLock::new(HashMap::new())),
            check_error: Arc::new(RwLock::new(None)),
            filter_error: Arc::new(RwLock::new(None)),
            save_error: Arc::new(RwLock::new(None)),
            save_rejections: Arc::new(RwLock::new(Vec::new())),
            progress: Arc::new(RwLock::new(100.0)),
            save_calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Seeds a stored document.
    pub async fn insert(&self, document: ResourceDocument) {
        let id = document.id().to_string();
        *self.revisions.write().await.entry(id.clone()).or_insert(0) += 1;
        self.documents.write().await.insert(id, document);
    }

    /// Stored document for `id`.
    pub async fn document(&self, id: &str) -> Option<ResourceDocument> {
        self.documents.read().await.get(id).cloned()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Ids passed to each `save` call, in call order.
    pub async fn save_calls(&self) -> Vec<Vec<String>> {
        self.save_calls.read().await.clone()
    }

    /// Fails the next `check`.
    pub async fn inject_check_error(&self, error: impl Into<String>) {
        *self.check_error.write().await = Some(error.into());
    }

    /// Fails the next `filter`.
    pub async fn inject_filter_error(&self, error: impl Into<String>) {
        *self.filter_error.write().await = Some(error.into());
    }

    /// Fails the next `save` as a whole.
    pub async fn inject_save_error(&self, error: impl Into<String>) {
        *self.save_error.write().await = Some(error.into());
    }

    /// Rejects `id` once in the next save that contains it.
    pub async fn reject_next_save_of(&self, id: impl Into<String>) {
        self.save_rejections.write().await.push(id.into());
    }

    /// Sets the reported index progress.
    pub async fn set_index_progress(&self, progress: f64) {
        *self.progress.write().await = progress;
    }

    fn revision_string(counter: u64, id: &str) -> String {
        format!("{counter}-{id}")
    }
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for MockStorage {
    fn check(
        &self,
        reference: ResourceItemReference,
    ) -> Pin<Box<dyn Future<Output = Result<LocalCheck>> + Send + '_>> {
        Box::pin(async move {
            if let Some(error) = self.check_error.write().await.take() {
                return Err(BridgeError::storage(error));
            }
            let documents = self.documents.read().await;
            let Some(stored) = documents.get(&reference.id) else {
                return Ok(LocalCheck::default());
            };
            let revision = self
                .revisions
                .read()
                .await
                .get(&reference.id)
                .map(|counter| Self::revision_string(*counter, &reference.id));
            let is_current =
                reference.date_modified.is_some_and(|wanted| stored.date_modified() >= wanted);
            Ok(LocalCheck { is_current, revision })
        })
    }

    fn filter(
        &self,
        ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, DateTime<Utc>>>> + Send + '_>> {
        Box::pin(async move {
            if let Some(error) = self.filter_error.write().await.take() {
                return Err(BridgeError::storage(error));
            }
            let documents = self.documents.read().await;
            Ok(ids
                .into_iter()
                .filter_map(|id| documents.get(&id).map(|doc| (id, doc.date_modified())))
                .collect())
        })
    }

    fn save(
        &self,
        documents: Vec<ResourceDocument>,
    ) -> Pin<Box<dyn Future<Output = Result<SaveReport>> + Send + '_>> {
        Box::pin(async move {
            let ids: Vec<String> = documents.iter().map(|doc| doc.id().to_string()).collect();
            self.save_calls.write().await.push(ids);

            if let Some(error) = self.save_error.write().await.take() {
                return Err(BridgeError::storage(error));
            }

            let mut report = SaveReport::default();
            let mut stored = self.documents.write().await;
            let mut revisions = self.revisions.write().await;
            let mut rejections = self.save_rejections.write().await;

            for mut document in documents {
                let id = document.id().to_string();
                if let Some(position) = rejections.iter().position(|rejected| *rejected == id) {
                    rejections.remove(position);
                    report.retry.push(id);
                    continue;
                }

                match stored.get(&id).map(ResourceDocument::date_modified) {
                    Some(existing) if existing >= document.date_modified() => {
                        report.skipped.push(id);
                    },
                    existing => {
                        let is_update = existing.is_some();
                        let counter = revisions.entry(id.clone()).or_insert(0);
                        *counter += 1;
                        let revision = Self::revision_string(*counter, &id);
                        document.set_revision(Some(&revision));
                        stored.insert(id.clone(), document);
                        if is_update {
                            report.updated.push(id);
                        } else {
                            report.created.push(id);
                        }
                    },
                }
            }
            Ok(report)
        })
    }

    fn get(
        &self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResourceDocument>>> + Send + '_>> {
        Box::pin(async move { Ok(self.documents.read().await.get(&id).cloned()) })
    }

    fn index_progress(&self) -> Pin<Box<dyn Future<Output = Result<f64>> + Send + '_>> {
        Box::pin(async move { Ok(*self.progress.read().await) })
    }

    fn prepare(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { Ok(()) })
    }
}
