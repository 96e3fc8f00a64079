//! Bounded queues shared between the feed pump, workers and client pool.
//!
//! [`ResourceQueue`] is the retrieval queue: entries are served by priority
//! and in insertion order within a priority. [`RetryQueue`] holds failed
//! references until their backoff delay elapses.
//!
//! Both queues provide backpressure. A producer facing a full queue waits up
//! to its timeout and then gets its item back instead of growing the queue
//! past capacity.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    fmt,
    future::poll_fn,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use edge_core::{Clock, QueueEntry};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, warn};

/// Maximum number of items a queue may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// At most this many items.
    Bounded(usize),
    /// No limit.
    Unbounded,
}

impl Capacity {
    /// Interprets a configured size where `-1` means unbounded.
    pub fn from_config(size: i64) -> Self {
        match usize::try_from(size) {
            Ok(size) => Self::Bounded(size),
            Err(_) => Self::Unbounded,
        }
    }

    /// Returns true if a queue holding `len` items can accept one more.
    pub fn has_room(&self, len: usize) -> bool {
        match self {
            Self::Bounded(limit) => len < *limit,
            Self::Unbounded => true,
        }
    }

    /// Bounded limit, if any.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Bounded(limit) => Some(*limit),
            Self::Unbounded => None,
        }
    }
}

/// Returned by a push that could not find room before its timeout.
///
/// Hands the rejected item back to the producer.
pub struct QueueFull<T>(pub T);

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

/// Source of queue entries a worker pulls from.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Takes the next eligible entry, waiting up to `timeout`.
    async fn next_entry(&self, timeout: Duration) -> Option<QueueEntry>;

    /// Entries currently eligible for processing.
    fn depth(&self) -> usize;

    /// Queue name used in log lines.
    fn name(&self) -> &'static str;
}

pub(crate) struct Ranked<K, T> {
    pub(crate) key: K,
    seq: u64,
    pub(crate) item: T,
}

impl<K: Ord, T> PartialEq for Ranked<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, T> Eq for Ranked<K, T> {}

impl<K: Ord, T> PartialOrd for Ranked<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> Ord for Ranked<K, T> {
    // Reversed so the max-heap yields the smallest key, oldest first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key).then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct HeapState<K, T> {
    pub(crate) heap: BinaryHeap<Ranked<K, T>>,
    next_seq: u64,
}

impl<K: Ord, T> HeapState<K, T> {
    pub(crate) fn new() -> Self {
        Self { heap: BinaryHeap::new(), next_seq: 0 }
    }

    pub(crate) fn insert(&mut self, key: K, item: T) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Ranked { key, seq, item });
    }
}

pub(crate) fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded retrieval queue, ordered by priority then insertion.
pub struct ResourceQueue {
    state: Mutex<HeapState<u32, QueueEntry>>,
    capacity: Capacity,
    not_empty: Notify,
    not_full: Notify,
    clock: Arc<dyn Clock>,
}

impl ResourceQueue {
    /// Creates an empty queue.
    pub fn new(capacity: Capacity, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(HeapState::new()),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            clock,
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        lock(&self.state).heap.len()
    }

    /// Returns true if no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues an entry, waiting up to `timeout` for room.
    ///
    /// # Errors
    ///
    /// Returns the entry inside `QueueFull` if the queue stayed full.
    pub async fn push(
        &self,
        entry: QueueEntry,
        timeout: Duration,
    ) -> std::result::Result<(), QueueFull<QueueEntry>> {
        let deadline = self.clock.now() + timeout;

        loop {
            let notified = self.not_full.notified();
            {
                let mut state = lock(&self.state);
                if self.capacity.has_room(state.heap.len()) {
                    state.insert(entry.priority, entry);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            let now = self.clock.now();
            if now >= deadline {
                return Err(QueueFull(entry));
            }
            tokio::select! {
                () = notified => {},
                () = self.clock.sleep(deadline - now) => {},
            }
        }
    }

    /// Takes the first entry, waiting up to `timeout` for one to arrive.
    pub async fn pop(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = self.clock.now() + timeout;

        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = lock(&self.state);
                if let Some(ranked) = state.heap.pop() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(ranked.item);
                }
            }

            let now = self.clock.now();
            if now >= deadline {
                return None;
            }
            tokio::select! {
                () = notified => {},
                () = self.clock.sleep(deadline - now) => {},
            }
        }
    }
}

#[async_trait]
impl ItemSource for ResourceQueue {
    async fn next_entry(&self, timeout: Duration) -> Option<QueueEntry> {
        self.pop(timeout).await
    }

    fn depth(&self) -> usize {
        self.len()
    }

    fn name(&self) -> &'static str {
        "resource_items_queue"
    }
}

/// Retry queue: entries wait out their delay, then become visible to retry
/// workers.
///
/// Delays are tracked by a scheduler task that owns a
/// [`tokio_util::time::DelayQueue`] and forwards each expired entry into a
/// ready queue served by priority. Capacity covers both waiting and ready
/// entries. The scheduler stops once the queue is dropped.
pub struct RetryQueue {
    inserts: mpsc::UnboundedSender<(QueueEntry, Duration)>,
    drains: mpsc::UnboundedSender<oneshot::Sender<Vec<QueueEntry>>>,
    ready: Arc<ResourceQueue>,
    held: AtomicUsize,
    capacity: Capacity,
    not_full: Notify,
    clock: Arc<dyn Clock>,
}

impl RetryQueue {
    /// Creates an empty retry queue and spawns its scheduler.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(capacity: Capacity, clock: Arc<dyn Clock>) -> Self {
        let (inserts, insert_rx) = mpsc::unbounded_channel();
        let (drains, drain_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(ResourceQueue::new(Capacity::Unbounded, clock.clone()));
        tokio::spawn(run_scheduler(insert_rx, drain_rx, ready.clone()));

        Self {
            inserts,
            drains,
            ready,
            held: AtomicUsize::new(0),
            capacity,
            not_full: Notify::new(),
            clock,
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// All held entries, waiting or ready.
    pub fn len(&self) -> usize {
        self.held.load(AtomicOrdering::Acquire)
    }

    /// Returns true if the queue holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries whose delay has elapsed.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Schedules `entry` to become visible after `delay`, waiting up to
    /// `timeout` for room.
    ///
    /// # Errors
    ///
    /// Returns the entry inside `QueueFull` if the queue stayed full or its
    /// scheduler has stopped.
    pub async fn push_after(
        &self,
        entry: QueueEntry,
        delay: Duration,
        timeout: Duration,
    ) -> std::result::Result<(), QueueFull<QueueEntry>> {
        let deadline = self.clock.now() + timeout;

        loop {
            let notified = self.not_full.notified();
            if self.reserve() {
                return self.inserts.send((entry, delay)).map_err(|mpsc::error::SendError((entry, _))| {
                    self.release(1);
                    QueueFull(entry)
                });
            }

            let now = self.clock.now();
            if now >= deadline {
                return Err(QueueFull(entry));
            }
            tokio::select! {
                () = notified => {},
                () = self.clock.sleep(deadline - now) => {},
            }
        }
    }

    /// Takes the first ready entry, waiting up to `timeout` for one.
    pub async fn pop(&self, timeout: Duration) -> Option<QueueEntry> {
        let entry = self.ready.pop(timeout).await?;
        self.release(1);
        Some(entry)
    }

    /// Removes and returns every held entry, ready ones first, then waiting
    /// ones by deadline.
    pub async fn drain(&self) -> Vec<QueueEntry> {
        let (reply, response) = oneshot::channel();
        let entries = if self.drains.send(reply).is_ok() {
            response.await.unwrap_or_default()
        } else {
            let mut entries = Vec::new();
            while let Some(entry) = self.ready.pop(Duration::ZERO).await {
                entries.push(entry);
            }
            entries
        };
        self.release(entries.len());
        entries
    }

    fn reserve(&self) -> bool {
        self.held
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |held| {
                self.capacity.has_room(held).then_some(held + 1)
            })
            .is_ok()
    }

    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        // Saturating: a drain racing a pop must not wrap the counter.
        let _ = self.held.fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |held| {
            Some(held.saturating_sub(count))
        });
        self.not_full.notify_waiters();
    }
}

async fn run_scheduler(
    mut inserts: mpsc::UnboundedReceiver<(QueueEntry, Duration)>,
    mut drains: mpsc::UnboundedReceiver<oneshot::Sender<Vec<QueueEntry>>>,
    ready: Arc<ResourceQueue>,
) {
    let mut delayed: DelayQueue<QueueEntry> = DelayQueue::new();
    let mut keys: HashSet<delay_queue::Key> = HashSet::new();

    loop {
        // Inserts first so a drain observes every entry scheduled before it.
        tokio::select! {
            biased;

            insert = inserts.recv() => match insert {
                Some((entry, delay)) => {
                    keys.insert(delayed.insert(entry, delay));
                },
                None => break,
            },
            Some(reply) = drains.recv() => {
                let mut entries = Vec::new();
                while let Some(entry) = ready.pop(Duration::ZERO).await {
                    entries.push(entry);
                }
                let mut waiting: Vec<_> =
                    keys.drain().filter_map(|key| delayed.try_remove(&key)).collect();
                waiting.sort_by_key(delay_queue::Expired::deadline);
                entries.extend(waiting.into_iter().map(delay_queue::Expired::into_inner));
                // A dropped receiver means the caller stopped waiting.
                let _ = reply.send(entries);
            },
            Some(expired) = poll_fn(|cx| delayed.poll_expired(cx)), if !delayed.is_empty() => {
                keys.remove(&expired.key());
                if let Err(QueueFull(entry)) = ready.push(expired.into_inner(), Duration::ZERO).await {
                    warn!(resource_id = %entry.reference.id, "ready retry queue rejected entry");
                }
            },
        }
    }

    debug!(waiting = delayed.len(), ready = ready.len(), "retry scheduler stopped");
}

#[async_trait]
impl ItemSource for RetryQueue {
    async fn next_entry(&self, timeout: Duration) -> Option<QueueEntry> {
        self.pop(timeout).await
    }

    fn depth(&self) -> usize {
        self.ready_len()
    }

    fn name(&self) -> &'static str {
        "retry_resource_items_queue"
    }
}
