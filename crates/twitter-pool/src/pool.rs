//! Client pool state machine and rate-limit aware leasing
//!
//! The pool holds one slot per client with its lease status and one
//! rate-limit window per endpoint category. Slots are scanned round-robin.
//! A semaphore with one permit per usable client bounds concurrent leases,
//! so a client is never handed to two fetches at once.
//!
//! Windows heal on their own: a window whose reset instant has passed counts
//! as available again without any explicit transition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use remote::{EndpointCategory, ErrorClassification, RateLimitSnapshot, TimelineApi};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Shortest wait imposed after a rate-limit error, even when the remote
/// reports a reset that has already passed.
const MIN_RESET_WAIT: Duration = Duration::from_secs(1);

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How many times one `acquire` may sleep until a window reset.
    pub max_quota_waits: u32,
    /// Assumed window length when a rate-limit error carries no reset.
    pub default_reset: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_quota_waits: 8,
            default_reset: Duration::from_secs(900),
        }
    }
}

/// Lease status of a pool client.
///
/// Transitions:
/// - Idle → Leased (acquire)
/// - Leased → Idle (lease dropped)
/// - Leased → Disabled (lease dropped after a rejected credential)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Idle,
    Leased,
    Disabled,
}

impl ClientStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            ClientStatus::Idle => "idle",
            ClientStatus::Leased => "leased",
            ClientStatus::Disabled => "disabled",
        }
    }
}

/// Last known rate-limit state of one endpoint category for one client.
///
/// Unknown remaining counts as available. `penalty_until` is set by a
/// rate-limit error and outranks polled snapshots until it passes.
#[derive(Debug, Clone, Copy, Default)]
struct Window {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    penalty_until: Option<Instant>,
}

impl Window {
    fn has_quota(&self, now: Instant) -> bool {
        match self.remaining {
            Some(0) => self.reset_at.is_none_or(|reset| now >= reset),
            _ => true,
        }
    }

    /// Fold in headers from a live response.
    fn record(&mut self, snapshot: RateLimitSnapshot, now: Instant) {
        self.limit = snapshot.limit.or(self.limit);
        self.remaining = Some(snapshot.remaining);
        self.reset_at = Some(now + snapshot.reset_in);
        self.penalty_until = None;
    }

    /// Fold in a polled snapshot. While a penalty is active the window stays
    /// exhausted; the snapshot can only push its reset further out.
    fn seed(&mut self, snapshot: RateLimitSnapshot, now: Instant) {
        match self.penalty_until {
            Some(until) if now < until => {
                self.limit = snapshot.limit.or(self.limit);
                if snapshot.remaining == 0 {
                    self.reset_at = Some(until.max(now + snapshot.reset_in));
                }
            }
            _ => self.record(snapshot, now),
        }
    }

    fn exhaust(&mut self, until: Instant) {
        self.remaining = Some(0);
        self.reset_at = Some(until);
        self.penalty_until = Some(until);
    }

    fn health(&self, now: Instant) -> serde_json::Value {
        serde_json::json!({
            "limit": self.limit,
            "remaining": self.remaining,
            "reset_in_secs": self.reset_at.map(|at| at.saturating_duration_since(now).as_secs()),
            "available": self.has_quota(now),
        })
    }
}

struct Slot {
    id: String,
    api: Arc<dyn TimelineApi>,
    status: ClientStatus,
    disable_on_release: bool,
    windows: [Window; 2],
}

struct State {
    slots: Vec<Slot>,
    leased: usize,
    peak_leased: usize,
}

/// Outcome of one scan over the slots.
enum Pick {
    Ready(usize),
    /// Idle clients exist but none has quota before this instant.
    WaitUntil(Instant),
    /// Every usable client is leased.
    WaitForRelease,
    Exhausted,
}

impl State {
    fn usable(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status != ClientStatus::Disabled)
            .count()
    }

    fn pick(&mut self, category: EndpointCategory, start: usize, now: Instant) -> Pick {
        let n = self.slots.len();
        let mut earliest: Option<Instant> = None;
        let mut any_leased = false;

        for offset in 0..n {
            let idx = (start + offset) % n;
            let slot = &mut self.slots[idx];
            match slot.status {
                ClientStatus::Disabled => continue,
                ClientStatus::Leased => {
                    any_leased = true;
                    continue;
                }
                ClientStatus::Idle => {}
            }

            let window = &slot.windows[category.index()];
            if window.has_quota(now) {
                slot.status = ClientStatus::Leased;
                self.leased += 1;
                self.peak_leased = self.peak_leased.max(self.leased);
                return Pick::Ready(idx);
            }
            if let Some(reset) = window.reset_at {
                earliest = Some(earliest.map_or(reset, |e| e.min(reset)));
            }
        }

        match earliest {
            Some(at) => Pick::WaitUntil(at),
            None if any_leased => Pick::WaitForRelease,
            None => Pick::Exhausted,
        }
    }
}

/// Pool of API clients, one per authenticated identity.
pub struct Pool {
    state: Mutex<State>,
    permits: Arc<Semaphore>,
    released: Notify,
    next_index: AtomicUsize,
    config: PoolConfig,
}

impl Pool {
    /// Create a pool over `clients`. All start idle with unknown windows.
    pub fn new(clients: Vec<Arc<dyn TimelineApi>>, config: PoolConfig) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::Empty);
        }
        let slots: Vec<Slot> = clients
            .into_iter()
            .map(|api| Slot {
                id: api.id().to_string(),
                api,
                status: ClientStatus::Idle,
                disable_on_release: false,
                windows: [Window::default(); 2],
            })
            .collect();
        info!(clients = slots.len(), "pool initialized");
        Ok(Self {
            permits: Arc::new(Semaphore::new(slots.len())),
            state: Mutex::new(State {
                slots,
                leased: 0,
                peak_leased: 0,
            }),
            released: Notify::new(),
            next_index: AtomicUsize::new(0),
            config,
        })
    }

    /// Lease a client with quota left for `category`.
    ///
    /// Waits for a free client when all are leased, and for the earliest
    /// window reset when every idle client is exhausted. Fails once every
    /// client is disabled or after `max_quota_waits` reset waits.
    pub async fn acquire(self: &Arc<Self>, category: EndpointCategory) -> Result<ClientLease> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| self.exhausted())?;

        let mut waits = 0u32;
        loop {
            // Register interest before scanning so a release between the
            // scan and the wait is not lost.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let pick = {
                let mut guard = self.lock();
                let state: &mut State = &mut guard;
                let start = self.next_index.fetch_add(1, Ordering::Relaxed) % state.slots.len();
                let pick = state.pick(category, start, Instant::now());
                if let Pick::Ready(index) = pick {
                    let slot = &state.slots[index];
                    metrics::gauge!("pool_clients_leased").set(state.leased as f64);
                    debug!(client = %slot.id, category = %category, "client leased");
                    return Ok(ClientLease {
                        pool: Arc::clone(self),
                        index,
                        id: slot.id.clone(),
                        api: Arc::clone(&slot.api),
                        permit: Some(permit),
                    });
                }
                pick
            };

            let deadline = match pick {
                Pick::Ready(_) => unreachable!("ready picks return above"),
                Pick::Exhausted => return Err(self.exhausted()),
                Pick::WaitForRelease => None,
                Pick::WaitUntil(at) => {
                    if waits >= self.config.max_quota_waits {
                        return Err(Error::QuotaWaitExhausted { category, waits });
                    }
                    info!(
                        category = %category,
                        wait_secs = at.saturating_duration_since(Instant::now()).as_secs(),
                        "no client has quota, waiting for reset"
                    );
                    Some(at)
                }
            };

            let reset = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = &mut released => {
                    debug!(category = %category, "client released, rescanning");
                }
                () = reset => {
                    waits += 1;
                    metrics::counter!("pool_quota_waits_total", "category" => category.label())
                        .increment(1);
                }
            }
        }
    }

    /// Fold a rate-limit snapshot into a client's window.
    pub(crate) fn record(&self, index: usize, category: EndpointCategory, snapshot: RateLimitSnapshot) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.windows[category.index()].record(snapshot, Instant::now());
        }
    }

    /// Fold a polled snapshot into a client's window without undoing a
    /// rate-limit error reported since the poll was issued.
    pub(crate) fn seed(&self, index: usize, category: EndpointCategory, snapshot: RateLimitSnapshot) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.windows[category.index()].seed(snapshot, Instant::now());
        }
    }

    fn has_quota(&self, index: usize, category: EndpointCategory) -> bool {
        let state = self.lock();
        state
            .slots
            .get(index)
            .is_some_and(|slot| slot.windows[category.index()].has_quota(Instant::now()))
    }

    /// Apply an error classification to a client.
    ///
    /// - RateLimited → window exhausted until the reported (or default) reset
    /// - CredentialRejected → client disabled when its lease is dropped
    /// - EntityFailure → no change
    fn report_error(
        &self,
        index: usize,
        category: EndpointCategory,
        classification: ErrorClassification,
        reset_in: Option<Duration>,
    ) {
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        match classification {
            ErrorClassification::RateLimited => {
                let wait = reset_in
                    .unwrap_or(self.config.default_reset)
                    .max(MIN_RESET_WAIT);
                info!(
                    client = %slot.id,
                    category = %category,
                    reset_secs = wait.as_secs(),
                    "client rate limited"
                );
                slot.windows[category.index()].exhaust(Instant::now() + wait);
            }
            ErrorClassification::CredentialRejected => {
                warn!(client = %slot.id, "credentials rejected, disabling client");
                slot.disable_on_release = true;
            }
            ErrorClassification::EntityFailure => {
                debug!(client = %slot.id, "entity failure, no pool action");
            }
        }
    }

    /// Return a leased slot to the pool.
    fn release(&self, index: usize, permit: Option<OwnedSemaphorePermit>) {
        let mut guard = self.lock();
        let state: &mut State = &mut guard;
        state.leased = state.leased.saturating_sub(1);
        metrics::gauge!("pool_clients_leased").set(state.leased as f64);

        if let Some(slot) = state.slots.get_mut(index) {
            if slot.disable_on_release {
                slot.status = ClientStatus::Disabled;
                if let Some(permit) = permit {
                    permit.forget();
                }
                let usable = state.usable();
                info!(client = %state.slots[index].id, usable, "client disabled");
                if usable == 0 {
                    warn!("every client disabled, closing pool");
                    self.permits.close();
                }
            } else {
                slot.status = ClientStatus::Idle;
                drop(permit);
            }
        }
        drop(guard);
        self.released.notify_waiters();
    }

    /// Number of clients that are not disabled.
    pub fn size(&self) -> usize {
        self.lock().usable()
    }

    /// Clients currently leased.
    pub fn leased(&self) -> usize {
        self.lock().leased
    }

    /// Highest number of simultaneous leases seen.
    pub fn peak_leased(&self) -> usize {
        self.lock().peak_leased
    }

    /// Clients to poll during a rate-limit sync: every client not disabled.
    pub(crate) fn sync_targets(&self) -> Vec<(usize, String, Arc<dyn TimelineApi>)> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status != ClientStatus::Disabled && !s.disable_on_release)
            .map(|(i, s)| (i, s.id.clone(), Arc::clone(&s.api)))
            .collect()
    }

    /// Pool health summary.
    ///
    /// Status mapping: no client disabled → healthy, some disabled →
    /// degraded, all disabled → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let state = self.lock();
        let now = Instant::now();
        let mut clients = Vec::with_capacity(state.slots.len());
        let (mut idle, mut leased, mut disabled) = (0usize, 0usize, 0usize);

        for slot in &state.slots {
            match slot.status {
                ClientStatus::Idle => idle += 1,
                ClientStatus::Leased => leased += 1,
                ClientStatus::Disabled => disabled += 1,
            }
            let mut windows = serde_json::Map::new();
            for category in EndpointCategory::ALL {
                windows.insert(
                    category.label().to_string(),
                    slot.windows[category.index()].health(now),
                );
            }
            clients.push(serde_json::json!({
                "id": slot.id,
                "status": slot.status.label(),
                "windows": windows,
            }));
        }

        let total = state.slots.len();
        let status = if disabled == 0 {
            "healthy"
        } else if disabled < total {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "clients_total": total,
            "clients_idle": idle,
            "clients_leased": leased,
            "clients_disabled": disabled,
            "peak_leased": state.peak_leased,
            "clients": clients,
        })
    }

    fn exhausted(&self) -> Error {
        let clients_total = self.lock().slots.len();
        warn!(clients_total, "acquire on an exhausted pool");
        Error::Exhausted { clients_total }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive use of one pool client. Dropping the lease returns the client.
pub struct ClientLease {
    pool: Arc<Pool>,
    index: usize,
    id: String,
    api: Arc<dyn TimelineApi>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ClientLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn api(&self) -> &dyn TimelineApi {
        self.api.as_ref()
    }

    /// Fold the rate-limit headers of a response into this client's window.
    pub fn record(&self, category: EndpointCategory, snapshot: Option<RateLimitSnapshot>) {
        if let Some(snapshot) = snapshot {
            self.pool.record(self.index, category, snapshot);
        }
    }

    /// Whether this client may still call `category` endpoints.
    pub fn has_quota(&self, category: EndpointCategory) -> bool {
        self.pool.has_quota(self.index, category)
    }

    /// Report a classified error seen on this client.
    pub fn report_error(
        &self,
        category: EndpointCategory,
        classification: ErrorClassification,
        reset_in: Option<Duration>,
    ) {
        self.pool
            .report_error(self.index, category, classification, reset_in);
    }
}

impl std::fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease").field("id", &self.id).finish()
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.pool.release(self.index, self.permit.take());
        debug!(client = %self.id, "client released");
    }
}
