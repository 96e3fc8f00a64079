//! Per-worker write buffer.
//!
//! Holds at most one document per id, always the one with the greatest
//! `dateModified` seen since the last flush.

use std::{
    collections::{hash_map::Entry, HashMap},
    time::{Duration, Instant},
};

use edge_core::{ResourceDocument, RetryMetadata};

/// Document waiting to be written, with the retry state of the reference
/// that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkEntry {
    /// Document to write.
    pub document: ResourceDocument,
    /// Retry state carried over if the write fails.
    pub retry: RetryMetadata,
}

/// Effect of [`Bulk::accumulate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulated {
    /// First document for this id.
    Inserted,
    /// Replaced an older pending document.
    Replaced,
    /// Discarded; the pending document is at least as fresh.
    Ignored,
}

/// Write buffer owned by a single worker.
#[derive(Debug, Default)]
pub struct Bulk {
    entries: HashMap<String, BulkEntry>,
    opened_at: Option<Instant>,
}

impl Bulk {
    /// Creates an empty bulk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending documents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending document for `id`.
    pub fn get(&self, id: &str) -> Option<&BulkEntry> {
        self.entries.get(id)
    }

    /// Adds a document unless an equal or fresher one is already pending.
    pub fn accumulate(
        &mut self,
        document: ResourceDocument,
        retry: RetryMetadata,
        now: Instant,
    ) -> Accumulated {
        if self.entries.is_empty() {
            self.opened_at = Some(now);
        }

        match self.entries.entry(document.id().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(BulkEntry { document, retry });
                Accumulated::Inserted
            },
            Entry::Occupied(mut slot) => {
                if document.date_modified() > slot.get().document.date_modified() {
                    slot.insert(BulkEntry { document, retry });
                    Accumulated::Replaced
                } else {
                    Accumulated::Ignored
                }
            },
        }
    }

    /// Returns true once the bulk reaches `limit`, has been open for
    /// `interval`, or the worker is stopping. An empty bulk never flushes.
    pub fn should_flush(&self, now: Instant, limit: usize, interval: Duration, stopping: bool) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let expired = self
            .opened_at
            .is_some_and(|opened| now.saturating_duration_since(opened) >= interval);
        stopping || self.entries.len() >= limit || expired
    }

    /// Empties the bulk, returning its entries ordered by id.
    pub fn take(&mut self) -> Vec<BulkEntry> {
        self.opened_at = None;
        let mut entries: Vec<BulkEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by(|a, b| a.document.id().cmp(b.document.id()));
        entries
    }
}
