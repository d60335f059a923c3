//! Adaptive pool of outbound sessions.
//!
//! Each [`PoolEntry`] owns at most one session and moves through
//! `Idle -> Connecting -> Connected -> Closed`. Entry tasks report removals
//! to a single maintenance task, which re-sizes the pool through one
//! coalescing [`CheckTimer`]. Sizing itself is the pure [`plan_sizing`].
//!
//! Connect failures back off once per sizing round, so entries that fail
//! together count as one failure.
//!
//! Lock order: the pool lock may be held while reading a session's channel
//! counts (the multiplexer lock), never the other way round.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PeerError, Result};
use crate::session::{ConnectMode, Connection, Session};
use crate::wire::Destination;

/// Pool sizing and retry behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Entries that should always have spare capacity.
    pub min_free: usize,
    /// Hard ceiling on entries. 0 means unbounded.
    pub max: usize,
    /// Idle entries kept beyond `min_free` before eviction starts.
    pub max_free: usize,
    /// Channels per session before it stops counting as available. 0 means
    /// unbounded.
    pub concurrency: usize,
    /// Pick an already connected entry over waiting for a new one.
    pub prefer_connected: bool,
    pub connect_delay: Duration,
    pub connect_delay_multiplier: f64,
    pub connect_delay_max: Duration,
    /// How long `acquire` waits for a usable session.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_free: 1,
            max: 0,
            max_free: 2,
            concurrency: 0,
            prefer_connected: true,
            connect_delay: Duration::from_millis(500),
            connect_delay_multiplier: 2.0,
            connect_delay_max: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.connect_delay_multiplier.is_finite() || self.connect_delay_multiplier < 1.0 {
            return Err(PeerError::Config(format!(
                "connect delay multiplier must be at least 1, got {}",
                self.connect_delay_multiplier
            )));
        }
        if self.max > 0 && self.min_free > self.max {
            return Err(PeerError::Config(format!(
                "pool min_free {} exceeds pool max {}",
                self.min_free, self.max
            )));
        }
        Ok(())
    }

    fn has_room(&self, load: usize) -> bool {
        self.concurrency == 0 || load < self.concurrency
    }
}

/// Load of one entry, as seen by [`plan_sizing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLoad {
    pub id: u64,
    pub created: Instant,
    pub connected: bool,
    pub local: usize,
    pub remote: usize,
}

impl EntryLoad {
    pub fn load(&self) -> usize {
        self.local + self.remote
    }
}

/// What a sizing pass should do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizingPlan {
    /// New entries to create.
    pub create: usize,
    /// Idle entries to close, oldest first.
    pub evict: Vec<u64>,
}

/// Decide how many entries to add and which idle ones to drop.
pub fn plan_sizing(entries: &[EntryLoad], config: &PoolConfig) -> SizingPlan {
    let available = entries
        .iter()
        .filter(|e| config.has_room(e.load()))
        .count();
    let mut create = config.min_free.saturating_sub(available);
    if config.max > 0 {
        create = create.min(config.max.saturating_sub(entries.len()));
    }

    let keep = config.min_free.max(config.max_free);
    let mut idle: Vec<&EntryLoad> = entries
        .iter()
        .filter(|e| e.connected && e.load() == 0)
        .collect();
    let mut evict = Vec::new();
    if idle.len() > keep {
        idle.sort_by_key(|e| (e.created, e.id));
        evict = idle[..idle.len() - keep].iter().map(|e| e.id).collect();
    }
    SizingPlan { create, evict }
}

/// Exponential connect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn fail(&mut self) -> Duration {
        let next = self.current.as_nanos() as f64 * self.multiplier;
        let cap = self.max.as_nanos() as f64;
        self.current = Duration::from_nanos(next.min(cap) as u64);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// A single pending re-check. Requests can only bring it forward.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckTimer {
    due: Option<Instant>,
}

impl CheckTimer {
    /// Ask for a check at `at`. Returns true if the pending time moved.
    pub fn request(&mut self, at: Instant) -> bool {
        match self.due {
            Some(due) if due <= at => false,
            _ => {
                self.due = Some(at);
                true
            }
        }
    }

    pub fn due(&self) -> Option<Instant> {
        self.due
    }

    /// Consume the pending check if it is due.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if due <= now => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

/// Produces sessions for the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a fully handshaken session. Should give up promptly once
    /// `cancel` fires.
    async fn open(&self, cancel: &CancellationToken) -> Result<Arc<Session>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    Connecting,
    Connected,
    Closed(CloseReason),
}

/// One pooled session slot.
pub struct PoolEntry {
    id: u64,
    /// Sizing round that created the entry.
    round: u64,
    created: Instant,
    state: watch::Sender<EntryState>,
    session: OnceLock<Arc<Session>>,
    /// Channels promised to callers of `acquire` but not yet opened.
    reserved: AtomicUsize,
    cancel: CancellationToken,
}

impl PoolEntry {
    fn new(id: u64, round: u64, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(EntryState::Idle);
        Self {
            id,
            round,
            created: Instant::now(),
            state,
            session: OnceLock::new(),
            reserved: AtomicUsize::new(0),
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> EntryState {
        self.state.borrow().clone()
    }

    fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), EntryState::Closed(_))
    }

    /// The session, once connected and while still open.
    pub fn session(&self) -> Option<Arc<Session>> {
        match *self.state.borrow() {
            EntryState::Connected => self.session.get().cloned(),
            _ => None,
        }
    }

    /// Move Idle to Connecting. Only the first caller wins.
    fn begin_connect(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == EntryState::Idle {
                *state = EntryState::Connecting;
                true
            } else {
                false
            }
        })
    }

    /// Reserved channels count as local load.
    fn snapshot(&self) -> EntryLoad {
        let session = self.session();
        let (local, remote) = match &session {
            Some(session) => (session.local_channels(), session.remote_channels()),
            None => (0, 0),
        };
        EntryLoad {
            id: self.id,
            created: self.created,
            connected: session.is_some(),
            local: local + self.reserved.load(Ordering::Acquire),
            remote,
        }
    }

    /// Wait until the entry is connected or closed.
    async fn settled(&self) -> EntryState {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, EntryState::Connected | EntryState::Closed(_)))
            .await
            .map(|s| (*s).clone());
        state.unwrap_or(EntryState::Closed(CloseReason::Closed))
    }
}

/// Holds one channel's worth of load on an entry until dropped.
struct Reservation {
    entry: Arc<PoolEntry>,
}

impl Reservation {
    /// Callers hold the pool lock, so no sizing pass sees the entry idle in
    /// between.
    fn new(entry: &Arc<PoolEntry>) -> Self {
        entry.reserved.fetch_add(1, Ordering::AcqRel);
        Self {
            entry: Arc::clone(entry),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.entry.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
enum PoolEvent {
    Removed { id: u64, failed_connect: bool },
    Check,
}

struct PoolState {
    entries: Vec<Arc<PoolEntry>>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    /// Last sizing round that created entries.
    round: u64,
    /// Last round whose failure was counted by `backoff`.
    failed_round: u64,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<PoolEvent>,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    /// Apply one sizing pass. Returns the entries it created.
    fn resize(self: &Arc<Self>) -> Vec<Arc<PoolEntry>> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        let now = Instant::now();
        let (created, evicted) = {
            let mut state = self.lock();
            let loads: Vec<EntryLoad> = state
                .entries
                .iter()
                .filter(|e| !e.is_closed())
                .map(|e| e.snapshot())
                .collect();
            let plan = plan_sizing(&loads, &self.config);

            let mut evicted = Vec::new();
            if !plan.evict.is_empty() {
                state.entries.retain(|e| {
                    if plan.evict.contains(&e.id) {
                        evicted.push(Arc::clone(e));
                        false
                    } else {
                        true
                    }
                });
            }

            let backing_off = state.retry_at.is_some_and(|at| at > now);
            let mut created = Vec::new();
            if !backing_off && plan.create > 0 {
                state.round += 1;
                for _ in 0..plan.create {
                    created.push(self.push_entry(&mut state));
                }
            }
            (created, evicted)
        };

        for entry in evicted {
            debug!(entry = entry.id, "evicting idle pool entry");
            entry.cancel.cancel();
        }
        for entry in &created {
            tokio::spawn(run_entry(Arc::clone(self), Arc::clone(entry)));
        }
        created
    }

    fn push_entry(&self, state: &mut PoolState) -> Arc<PoolEntry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(PoolEntry::new(id, state.round, self.cancel.child_token()));
        state.entries.push(Arc::clone(&entry));
        entry
    }

    /// Add one entry beyond the sizing plan, unless at the ceiling.
    fn add_entry(self: &Arc<Self>) -> Option<Arc<PoolEntry>> {
        let entry = {
            let mut state = self.lock();
            let live = state.entries.iter().filter(|e| !e.is_closed()).count();
            if self.config.max > 0 && live >= self.config.max {
                return None;
            }
            state.round += 1;
            self.push_entry(&mut state)
        };
        tokio::spawn(run_entry(Arc::clone(self), Arc::clone(&entry)));
        Some(entry)
    }

    /// Reserve a channel on `entry` if it is still pooled and connected.
    fn reserve(&self, entry: &Arc<PoolEntry>) -> Option<(Reservation, Arc<Session>)> {
        let state = self.lock();
        if !state.entries.iter().any(|e| Arc::ptr_eq(e, entry)) {
            return None;
        }
        let session = entry.session().filter(|s| !s.is_closed())?;
        Some((Reservation::new(entry), session))
    }

    /// Count a connect failure, once per sizing round. Returns the retry delay.
    fn record_failure(&self, entry: &PoolEntry) -> Duration {
        let mut state = self.lock();
        if entry.round > state.failed_round {
            state.failed_round = entry.round;
            state.backoff.fail();
        }
        let delay = state.backoff.current();
        state.retry_at = Some(Instant::now() + delay);
        delay
    }

    fn remove(&self, id: u64) -> Option<Instant> {
        let mut state = self.lock();
        state.entries.retain(|e| e.id != id);
        state.retry_at
    }
}

async fn run_entry(inner: Arc<PoolInner>, entry: Arc<PoolEntry>) {
    if !entry.begin_connect() {
        return;
    }
    debug!(entry = entry.id, "pool entry connecting");

    let opened = tokio::select! {
        biased;
        _ = entry.cancel.cancelled() => Err(PeerError::Cancelled),
        opened = inner.factory.open(&entry.cancel) => opened,
    };

    let session = match opened {
        Ok(session) if !entry.cancel.is_cancelled() => session,
        Ok(session) => {
            session.close().await;
            entry
                .state
                .send_replace(EntryState::Closed(CloseReason::Closed));
            inner.notify(PoolEvent::Removed {
                id: entry.id,
                failed_connect: false,
            });
            return;
        }
        Err(e) => {
            let delay = inner.record_failure(&entry);
            if !matches!(e, PeerError::Cancelled) {
                warn!(entry = entry.id, error = %e, retry_in = ?delay, "pool connect failed");
            }
            entry
                .state
                .send_replace(EntryState::Closed(CloseReason::Error(e.reason())));
            inner.notify(PoolEvent::Removed {
                id: entry.id,
                failed_connect: true,
            });
            return;
        }
    };

    {
        let mut state = inner.lock();
        state.backoff.reset();
        state.retry_at = None;
    }
    let _ = entry.session.set(Arc::clone(&session));
    entry.state.send_replace(EntryState::Connected);
    info!(entry = entry.id, "pool entry connected");

    let reason = tokio::select! {
        reason = session.closed() => CloseReason::Error(reason),
        _ = entry.cancel.cancelled() => {
            session.close().await;
            CloseReason::Closed
        }
    };
    debug!(entry = entry.id, ?reason, "pool entry closed");
    entry.state.send_replace(EntryState::Closed(reason));
    inner.notify(PoolEvent::Removed {
        id: entry.id,
        failed_connect: false,
    });
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn maintain(
    inner: Weak<PoolInner>,
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
    cancel: CancellationToken,
) {
    let mut timer = CheckTimer::default();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => Some(event),
                None => break,
            },
            _ = sleep_until(timer.due()) => None,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let now = Instant::now();
        match event {
            Some(PoolEvent::Removed { id, failed_connect }) => {
                let retry_at = inner.remove(id);
                let at = match retry_at {
                    Some(at) if failed_connect => at.max(now),
                    _ => now,
                };
                timer.request(at);
            }
            Some(PoolEvent::Check) => {
                timer.request(now);
            }
            None => {}
        }
        if timer.take_due(now) {
            inner.resize();
        }
    }
    debug!("pool maintenance stopped");
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub entries: usize,
    pub connecting: usize,
    pub connected: usize,
    pub local_channels: usize,
    pub remote_channels: usize,
    pub backoff_ms: u64,
    pub retry_in_ms: Option<u64>,
}

/// A self-sizing set of client sessions.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create the pool and start filling it.
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let (events, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let backoff = Backoff::new(
            config.connect_delay,
            config.connect_delay_multiplier,
            config.connect_delay_max,
        );
        let inner = Arc::new(PoolInner {
            config,
            factory,
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                backoff,
                retry_at: None,
                round: 0,
                failed_round: 0,
            }),
            events,
            cancel: cancel.clone(),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(maintain(Arc::downgrade(&inner), rx, cancel));
        inner.notify(PoolEvent::Check);
        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get a connected session with spare capacity.
    pub async fn acquire(&self) -> Result<Arc<Session>> {
        let (_reservation, session) = self.acquire_reserved().await?;
        Ok(session)
    }

    /// Like [`ConnectionPool::acquire`], but the session stays reserved, and
    /// so cannot be evicted as idle, until the reservation is dropped.
    async fn acquire_reserved(&self) -> Result<(Reservation, Arc<Session>)> {
        let timeout = self.inner.config.acquire_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(PeerError::SessionClosed("pool closed".to_string()));
            }
            let created = self.inner.resize();
            let (connected, pending, retry_at, full) = self.candidates();
            if let Some(reserved) = connected {
                return Ok(reserved);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PeerError::Timeout(timeout));
            }
            let backing_off = retry_at.filter(|at| *at > now);
            let waiting = created.into_iter().next().or(pending).or_else(|| {
                if full || backing_off.is_some() {
                    None
                } else {
                    self.inner.add_entry()
                }
            });
            match (waiting, backing_off) {
                (Some(entry), _) => match tokio::time::timeout_at(deadline, entry.settled()).await {
                    Err(_) => return Err(PeerError::Timeout(timeout)),
                    Ok(EntryState::Connected) => {
                        if let Some(reserved) = self.inner.reserve(&entry) {
                            return Ok(reserved);
                        }
                    }
                    Ok(_) => {}
                },
                (None, Some(at)) => {
                    if at >= deadline {
                        return Err(PeerError::Timeout(timeout));
                    }
                    tokio::time::sleep_until(at).await;
                }
                (None, None) => return Err(PeerError::PoolExhausted),
            }
        }
    }

    /// Best connected session (already reserved), a pending entry to wait
    /// on, the retry time and whether the pool is at its ceiling.
    fn candidates(
        &self,
    ) -> (
        Option<(Reservation, Arc<Session>)>,
        Option<Arc<PoolEntry>>,
        Option<Instant>,
        bool,
    ) {
        let config = &self.inner.config;
        let state = self.inner.lock();
        let mut best: Option<(usize, &Arc<PoolEntry>, Arc<Session>)> = None;
        let mut pending = None;
        for entry in &state.entries {
            match entry.state() {
                EntryState::Connected => {
                    let Some(session) = entry.session().filter(|s| !s.is_closed()) else {
                        continue;
                    };
                    let local = session.local_channels() + entry.reserved.load(Ordering::Acquire);
                    if !config.has_room(local + session.remote_channels()) {
                        continue;
                    }
                    if best.as_ref().map_or(true, |(l, _, _)| local < *l) {
                        best = Some((local, entry, session));
                    }
                }
                EntryState::Idle | EntryState::Connecting => {
                    if pending.is_none() {
                        pending = Some(Arc::clone(entry));
                    }
                }
                EntryState::Closed(_) => {}
            }
        }
        let live = state.entries.iter().filter(|e| !e.is_closed()).count();
        let full = config.max > 0 && live >= config.max;

        let connected = match (&pending, config.prefer_connected) {
            (Some(_), false) => None,
            _ => best.map(|(_, entry, session)| (Reservation::new(entry), session)),
        };
        (connected, pending, state.retry_at, full)
    }

    /// Open a proxied connection through a pooled session.
    pub async fn connect(&self, destination: &Destination, mode: ConnectMode) -> Result<Connection> {
        let (reservation, session) = self.acquire_reserved().await?;
        let result = session.connect(destination, mode).await;
        drop(reservation);
        self.inner.notify(PoolEvent::Check);
        result
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let mut stats = PoolStats {
            backoff_ms: state.backoff.current().as_millis() as u64,
            retry_in_ms: state
                .retry_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64),
            ..PoolStats::default()
        };
        for entry in state.entries.iter().filter(|e| !e.is_closed()) {
            stats.entries += 1;
            match entry.state() {
                EntryState::Idle | EntryState::Connecting => stats.connecting += 1,
                EntryState::Connected => {
                    stats.connected += 1;
                    if let Some(session) = entry.session() {
                        stats.local_channels += session.local_channels();
                        stats.remote_channels += session.remote_channels();
                    }
                }
                EntryState::Closed(_) => {}
            }
        }
        stats
    }

    /// Close every session and stop maintenance.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let entries = std::mem::take(&mut self.inner.lock().entries);
        for entry in entries {
            if let Some(session) = entry.session.get() {
                session.close().await;
            }
        }
        info!("connection pool closed");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
