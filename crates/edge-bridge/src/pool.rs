//! Adaptive pool of upstream API sessions.
//!
//! Idle handles wait in a heap keyed by the time their `request_interval`
//! expires, so a throttled client is simply invisible to
//! [`ApiClientPool::acquire`] until it has cooled down. The pool also keeps a
//! health registry per client that survives check-outs; the performance
//! watcher reads it to find clients that are slower than their peers.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};

use edge_core::{Clock, ClientId};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::{
    client::{ApiClient, ClientConfig},
    error::{BridgeError, Result},
    queue::{lock, HeapState},
    stats::{self, DurationSummary, RuntimeStats},
};

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Settings shared by every session.
    pub client: ClientConfig,
    /// Identifier of this bridge instance, part of every user agent.
    pub bridge_id: String,
    /// Upper bound on live clients.
    pub max_clients: usize,
}

/// What a rate-limit response did to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    /// Interval grew by one step.
    Backoff,
    /// Interval passed the drop threshold; reset and flagged for renewal.
    Renew,
}

/// Upstream session checked out by exactly one worker at a time.
#[derive(Debug)]
pub struct ApiClientHandle {
    /// Stable client identifier.
    pub id: ClientId,
    /// HTTP session.
    pub session: ApiClient,
    /// Delay before this handle becomes eligible again after release.
    pub request_interval: Duration,
    /// Renew the session on next acquire.
    pub drop_cookies: bool,
    /// Discard on next acquire or release.
    pub destroy: bool,
    /// Request samples not yet merged into the pool registry.
    pub request_durations: BTreeMap<SystemTime, Duration>,
}

impl ApiClientHandle {
    fn new(id: ClientId, session: ApiClient) -> Self {
        Self {
            id,
            session,
            request_interval: Duration::ZERO,
            drop_cookies: false,
            destroy: false,
            request_durations: BTreeMap::new(),
        }
    }

    /// Records one upstream request.
    pub fn record_request(&mut self, at: SystemTime, duration: Duration) {
        self.request_durations.insert(at, duration);
    }

    /// Shrinks the interval after a successful request.
    pub fn record_success(&mut self, dec_step: Duration) {
        self.request_interval = self.request_interval.saturating_sub(dec_step);
    }

    /// Applies a 429 to the handle.
    pub fn record_rate_limit(&mut self, inc_step: Duration, drop_threshold: Duration) -> RateLimitAction {
        if self.request_interval > drop_threshold {
            self.request_interval = Duration::ZERO;
            self.drop_cookies = true;
            RateLimitAction::Renew
        } else {
            self.request_interval += inc_step;
            RateLimitAction::Backoff
        }
    }
}

/// Performance bookkeeping for one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientHealth {
    /// Request samples, keyed by completion time.
    pub request_durations: BTreeMap<SystemTime, Duration>,
    /// Interval reported at the last release.
    pub request_interval: Duration,
    /// Mean request duration in seconds.
    pub avg_duration: f64,
    /// No recent samples remain although older ones existed.
    pub grown: bool,
}

impl ClientHealth {
    /// Prunes samples older than `retention` and refreshes `avg_duration`
    /// and `grown`.
    pub fn refresh(&mut self, now: SystemTime, retention: Duration) {
        let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
        let recent = self.request_durations.split_off(&cutoff);
        let stale = std::mem::replace(&mut self.request_durations, recent);

        if !self.request_durations.is_empty() {
            self.grown = false;
            self.avg_duration = mean_seconds(self.request_durations.values());
        } else if !stale.is_empty() {
            self.grown = true;
            self.avg_duration = mean_seconds(stale.values());
        }
    }

    fn has_data(&self) -> bool {
        self.grown || !self.request_durations.is_empty()
    }
}

fn mean_seconds<'a>(durations: impl Iterator<Item = &'a Duration>) -> f64 {
    let values: Vec<f64> = durations.map(Duration::as_secs_f64).collect();
    stats::mean(&values)
}

/// Result of one performance evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceReport {
    /// Mean of `avg_duration` over clients with recent samples.
    pub mean: f64,
    /// Population standard deviation of the same set.
    pub std_dev: f64,
    /// Clients classified as degraded.
    pub degraded: Vec<ClientId>,
}

/// Refreshes every client and classifies the degraded ones.
///
/// A client is degraded when it is being throttled and is either slower than
/// the mean or has gone quiet. A client with recent samples is also degraded
/// when its average exceeds `multiplier` times a non-zero population mean;
/// quiet clients are never judged against the active population.
pub fn classify_clients(
    clients: &mut HashMap<ClientId, ClientHealth>,
    now: SystemTime,
    retention: Duration,
    multiplier: f64,
) -> PerformanceReport {
    for health in clients.values_mut() {
        health.refresh(now, retention);
    }

    let averages: Vec<f64> = clients
        .values()
        .filter(|health| !health.grown && health.has_data())
        .map(|health| health.avg_duration)
        .collect();
    let mean = stats::mean(&averages);
    let std_dev = stats::population_std_dev(&averages);

    let mut degraded: Vec<ClientId> = clients
        .iter()
        .filter(|(_, health)| health.has_data())
        .filter(|(_, health)| {
            let throttled = !health.request_interval.is_zero();
            let outlier = !health.grown && mean > 0.0 && health.avg_duration > multiplier * mean;
            outlier || (throttled && (health.avg_duration > mean || health.grown))
        })
        .map(|(id, _)| *id)
        .collect();
    degraded.sort();

    PerformanceReport { mean, std_dev, degraded }
}

/// Idle handles ordered by the instant they become eligible again.
///
/// Workers acquire concurrently, each under its own timeout, so the heap is
/// shared behind a mutex and waiters are woken on every release.
struct IdleClients {
    state: Mutex<HeapState<Instant, ApiClientHandle>>,
    released: Notify,
    clock: Arc<dyn Clock>,
}

impl IdleClients {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(HeapState::new()), released: Notify::new(), clock }
    }

    fn push_after(&self, handle: ApiClientHandle, delay: Duration) {
        let ready_at = self.clock.now() + delay;
        lock(&self.state).insert(ready_at, handle);
        self.released.notify_one();
    }

    fn ready_len(&self) -> usize {
        let now = self.clock.now();
        lock(&self.state).heap.iter().filter(|ranked| ranked.key <= now).count()
    }

    async fn pop(&self, timeout: Duration) -> Option<ApiClientHandle> {
        let deadline = self.clock.now() + timeout;

        loop {
            let released = self.released.notified();
            let until_ready = {
                let mut state = lock(&self.state);
                let now = self.clock.now();
                match state.heap.peek().map(|ranked| ranked.key) {
                    Some(ready_at) if ready_at <= now => {
                        return state.heap.pop().map(|ranked| ranked.item);
                    },
                    Some(ready_at) => Some(ready_at - now),
                    None => None,
                }
            };

            let now = self.clock.now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline - now;
            let wait = until_ready.map_or(remaining, |until| until.min(remaining));
            tokio::select! {
                () = released => {},
                () = self.clock.sleep(wait) => {},
            }
        }
    }
}

/// Pool of upstream sessions shared by all workers.
pub struct ApiClientPool {
    config: PoolConfig,
    idle: IdleClients,
    registry: Mutex<HashMap<ClientId, ClientHealth>>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<RuntimeStats>>,
}

impl ApiClientPool {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig, clock: Arc<dyn Clock>, stats: Arc<RwLock<RuntimeStats>>) -> Self {
        Self {
            config,
            idle: IdleClients::new(clock.clone()),
            registry: Mutex::new(HashMap::new()),
            clock,
            stats,
        }
    }

    /// Live clients, idle or checked out.
    pub fn len(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Returns true if the pool has no live clients.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idle clients eligible right now.
    pub fn idle_len(&self) -> usize {
        self.idle.ready_len()
    }

    /// Upper bound on live clients.
    pub fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    /// Builds, establishes and pools a new session.
    ///
    /// # Errors
    ///
    /// Returns the session error if the host is malformed or unreachable;
    /// the failure is counted and the pool stays one short.
    pub async fn create_client(&self) -> Result<ClientId> {
        let id = ClientId::new();
        let user_agent = format!("{}/{}/{}", self.config.client.user_agent, self.config.bridge_id, id);

        let established = async {
            let session = ApiClient::new(&self.config.client, user_agent)?;
            session.establish_session().await?;
            Ok::<_, BridgeError>(session)
        }
        .await;

        let session = match established {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    message_id = e.message_id(),
                    code = e.code(),
                    error = %e,
                    "failed to start api client"
                );
                self.stats.write().await.client_create_failures += 1;
                return Err(e);
            },
        };

        lock(&self.registry).insert(id, ClientHealth::default());
        info!(client_id = %id, user_agent = session.user_agent(), "started api client");
        self.requeue(ApiClientHandle::new(id, session), Duration::ZERO);
        Ok(id)
    }

    /// Creates clients until `target` are live, bounded by `max_clients`.
    ///
    /// Returns how many were created. Stops at the first failure.
    pub async fn top_up(&self, target: usize) -> usize {
        let target = target.min(self.config.max_clients);
        let mut created = 0;
        while self.len() < target {
            if self.create_client().await.is_err() {
                break;
            }
            created += 1;
        }
        created
    }

    /// Takes the earliest eligible client, waiting up to `timeout`.
    ///
    /// Destroyed clients are discarded along the way. A client flagged for
    /// cookie renewal is renewed before it is handed out; if that fails the
    /// client is discarded and `None` is returned.
    pub async fn acquire(&self, timeout: Duration) -> Option<ApiClientHandle> {
        let deadline = self.clock.now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(self.clock.now());
            let mut handle = self.idle.pop(remaining).await?;

            if handle.destroy || !lock(&self.registry).contains_key(&handle.id) {
                self.discard(handle.id);
                continue;
            }

            if handle.drop_cookies {
                if let Err(e) = self.renew(&mut handle).await {
                    warn!(
                        client_id = %handle.id,
                        message_id = e.message_id(),
                        error = %e,
                        "failed to renew api client, discarding"
                    );
                    self.discard(handle.id);
                    return None;
                }
                self.stats.write().await.renewed_clients += 1;
            }

            return Some(handle);
        }
    }

    /// Returns a client to the pool.
    ///
    /// The handle becomes eligible again once its `request_interval` has
    /// elapsed. Its request samples move into the registry.
    pub async fn release(&self, mut handle: ApiClientHandle) {
        {
            let mut registry = lock(&self.registry);
            match registry.get_mut(&handle.id) {
                Some(health) if !handle.destroy => {
                    health.request_durations.append(&mut handle.request_durations);
                    health.request_interval = handle.request_interval;
                },
                _ => {
                    registry.remove(&handle.id);
                    debug!(client_id = %handle.id, "discarded destroyed api client");
                    return;
                },
            }
        }

        let delay = handle.request_interval;
        self.requeue(handle, delay);
    }

    /// Flags a client for destruction; it is dropped at its next acquire or
    /// release.
    pub fn retire(&self, id: ClientId) -> bool {
        let removed = lock(&self.registry).remove(&id).is_some();
        if removed {
            info!(client_id = %id, "retired api client");
        }
        removed
    }

    /// Runs the degraded-client classification over the registry and retires
    /// every degraded client.
    pub fn evaluate_health(&self, retention: Duration, multiplier: f64) -> PerformanceReport {
        let now = self.clock.now_system();
        let report = {
            let mut registry = lock(&self.registry);
            classify_clients(&mut registry, now, retention, multiplier)
        };
        for id in &report.degraded {
            self.retire(*id);
        }
        report
    }

    /// Request duration summary over every recent sample in the registry.
    pub fn request_duration_summary(&self) -> DurationSummary {
        let values: Vec<f64> = lock(&self.registry)
            .values()
            .flat_map(|health| health.request_durations.values())
            .map(Duration::as_secs_f64)
            .collect();
        DurationSummary::from_values(&values)
    }

    /// Snapshot of one client's health record.
    pub fn health(&self, id: ClientId) -> Option<ClientHealth> {
        lock(&self.registry).get(&id).cloned()
    }

    /// Identifiers of every live client.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = lock(&self.registry).keys().copied().collect();
        ids.sort();
        ids
    }

    async fn renew(&self, handle: &mut ApiClientHandle) -> Result<()> {
        handle.session.clear_cookies()?;
        handle.session.establish_session().await?;
        handle.drop_cookies = false;
        debug!(client_id = %handle.id, "renewed api client session");
        Ok(())
    }

    fn requeue(&self, handle: ApiClientHandle, delay: Duration) {
        self.idle.push_after(handle, delay);
    }

    fn discard(&self, id: ClientId) {
        lock(&self.registry).remove(&id);
        debug!(client_id = %id, "discarded api client");
    }
}
