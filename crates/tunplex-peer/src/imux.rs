//! Inverse multiplexing: one logical stream spread over several legs.
//!
//! The client dials every leg, announces it with a `chs2:` request and waits
//! for all of them before handing out a [`MergedStream`]. The server parks
//! legs in an [`ImuxTable`] until the session is complete, then answers each
//! leg and starts a session on the merged stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunplex_transport::{BoxMsgStream, MsgStream, TransportError};

use crate::error::{PeerError, Result};
use crate::wire::{Command, Destination, ImuxLeg, Reply, Request};

/// How long the server waits for a session's remaining legs.
pub const DEFAULT_IMUX_DEADLINE: Duration = Duration::from_secs(10);

const LEG_QUEUE: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Direction of one leg, from the side that dialled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegKind {
    Duplex,
    SendOnly,
    RecvOnly,
}

impl LegKind {
    pub fn can_send(self) -> bool {
        !matches!(self, LegKind::RecvOnly)
    }

    pub fn can_recv(self) -> bool {
        !matches!(self, LegKind::SendOnly)
    }

    /// The same leg seen from the other end.
    pub fn inverted(self) -> Self {
        match self {
            LegKind::Duplex => LegKind::Duplex,
            LegKind::SendOnly => LegKind::RecvOnly,
            LegKind::RecvOnly => LegKind::SendOnly,
        }
    }
}

/// Leg counts for one IMUX session. Legs are indexed duplex first, then
/// send-only, then receive-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImuxPlan {
    /// Duplex legs.
    pub ws: u16,
    /// Send-only legs.
    pub wsso: u16,
    /// Receive-only legs.
    pub http: u16,
    /// Stagger between leg dials: leg `i` starts after `i * delay`.
    pub delay: Duration,
}

impl ImuxPlan {
    pub fn new(ws: u16, wsso: u16, http: u16) -> Self {
        Self {
            ws,
            wsso,
            http,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The shape advertised by a server-side leg.
    pub fn from_leg(leg: &ImuxLeg) -> Self {
        Self::new(leg.ws, leg.wsso, leg.http)
    }

    pub fn total(&self) -> usize {
        self.ws as usize + self.wsso as usize + self.http as usize
    }

    pub fn is_enabled(&self) -> bool {
        self.total() > 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.total() > u16::MAX as usize {
            return Err(PeerError::Config(format!(
                "imux plan has {} legs, at most {} allowed",
                self.total(),
                u16::MAX
            )));
        }
        let can_send = self.legs().any(LegKind::can_send);
        let can_recv = self.legs().any(LegKind::can_recv);
        if !can_send || !can_recv {
            return Err(PeerError::Config(
                "imux plan needs at least one send-capable and one receive-capable leg".to_string(),
            ));
        }
        Ok(())
    }

    pub fn kind_at(&self, index: usize) -> Option<LegKind> {
        let ws = self.ws as usize;
        let wsso = ws + self.wsso as usize;
        match index {
            i if i < ws => Some(LegKind::Duplex),
            i if i < wsso => Some(LegKind::SendOnly),
            i if i < self.total() => Some(LegKind::RecvOnly),
            _ => None,
        }
    }

    pub fn legs(&self) -> impl Iterator<Item = LegKind> {
        let plan = *self;
        (0..plan.total()).filter_map(move |i| plan.kind_at(i))
    }

    fn leg(&self, session_id: &str, index: usize) -> ImuxLeg {
        ImuxLeg {
            session_id: session_id.to_string(),
            ws: self.ws,
            index: index as u16,
            wsso: self.wsso,
            http: self.http,
        }
    }
}

/// Opens one physical leg toward the server.
#[async_trait]
pub trait LegDialer: Send + Sync {
    async fn dial(&self, kind: LegKind) -> Result<BoxMsgStream>;
}

/// Dial every leg of `plan` and merge them.
///
/// All or nothing: if any leg fails, or `cancel` fires, the remaining dials
/// are aborted and every leg opened so far is closed.
pub async fn bootstrap(
    dialer: Arc<dyn LegDialer>,
    plan: ImuxPlan,
    request_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<MergedStream> {
    plan.validate()?;
    let session_id = format!("{:08x}", rand::thread_rng().gen::<u32>());
    debug!(session = %session_id, legs = plan.total(), "starting imux bootstrap");

    let opened: Arc<Mutex<Vec<BoxMsgStream>>> = Arc::default();
    let mut set = JoinSet::new();
    for (index, kind) in plan.legs().enumerate() {
        let dialer = Arc::clone(&dialer);
        let opened = Arc::clone(&opened);
        let leg = plan.leg(&session_id, index);
        let stagger = plan.delay * index as u32;
        set.spawn(async move {
            if !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            let stream = dialer.dial(kind).await?;
            lock(&opened).push(Arc::clone(&stream));
            announce_leg(&stream, leg, request_timeout).await?;
            Ok::<_, PeerError>((index, kind, stream))
        });
    }

    let mut legs: Vec<Option<(LegKind, BoxMsgStream)>> = vec![None; plan.total()];
    let failure = loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Some(PeerError::Cancelled),
            joined = set.join_next() => joined,
        };
        match joined {
            None => break None,
            Some(Ok(Ok((index, kind, stream)))) => legs[index] = Some((kind, stream)),
            Some(Ok(Err(e))) => break Some(e),
            Some(Err(e)) => break Some(PeerError::Imux(format!("leg task failed: {e}"))),
        }
    };

    if let Some(err) = failure {
        set.shutdown().await;
        let opened = std::mem::take(&mut *lock(&opened));
        for stream in &opened {
            let _ = stream.close().await;
        }
        warn!(
            session = %session_id,
            closed = opened.len(),
            error = %err,
            "imux bootstrap failed"
        );
        return Err(match err {
            PeerError::Cancelled => PeerError::Cancelled,
            other => PeerError::Imux(other.reason()),
        });
    }

    let legs: Vec<_> = legs.into_iter().flatten().collect();
    info!(session = %session_id, legs = legs.len(), "imux session established");
    Ok(MergedStream::new(format!("imux:{session_id}"), legs))
}

async fn announce_leg(stream: &BoxMsgStream, leg: ImuxLeg, timeout: Duration) -> Result<()> {
    let request = Request::new(Destination::unspecified(), Command::Imux(leg));
    stream.send(request.encode()?).await?;
    let msg = tokio::time::timeout(timeout, stream.recv())
        .await
        .map_err(|_| PeerError::Timeout(timeout))??
        .ok_or_else(|| PeerError::SessionClosed("leg closed before reply".to_string()))?;
    let reply = Reply::decode(&msg)?;
    if !reply.is_ok() {
        return Err(PeerError::Rejected {
            status: reply.status,
            message: reply.message,
        });
    }
    Ok(())
}

enum LegEvent {
    Message(Bytes),
    Eof,
    Failed(String),
}

/// Several legs presented as one message stream.
///
/// Sends rotate over the send-capable legs; receives take whatever arrives
/// first on any receive-capable leg. Order holds per leg only. End of stream
/// on any leg ends the merged stream.
pub struct MergedStream {
    label: String,
    legs: Vec<BoxMsgStream>,
    senders: Vec<BoxMsgStream>,
    next: AtomicUsize,
    events: tokio::sync::Mutex<mpsc::Receiver<LegEvent>>,
    readers: Vec<JoinHandle<()>>,
    eof: AtomicBool,
}

impl MergedStream {
    pub fn new(label: impl Into<String>, legs: Vec<(LegKind, BoxMsgStream)>) -> Self {
        let (tx, rx) = mpsc::channel(LEG_QUEUE);
        let mut readers = Vec::new();
        for (kind, leg) in legs.iter().filter(|(kind, _)| kind.can_recv()) {
            let leg = Arc::clone(leg);
            let tx = tx.clone();
            let kind = *kind;
            readers.push(tokio::spawn(async move {
                loop {
                    let event = match leg.recv().await {
                        Ok(Some(msg)) => LegEvent::Message(msg),
                        Ok(None) => LegEvent::Eof,
                        Err(e) => LegEvent::Failed(format!("{kind:?} leg {}: {e}", leg.describe())),
                    };
                    let last = !matches!(event, LegEvent::Message(_));
                    if tx.send(event).await.is_err() || last {
                        break;
                    }
                }
            }));
        }

        Self {
            label: label.into(),
            senders: legs
                .iter()
                .filter(|(kind, _)| kind.can_send())
                .map(|(_, leg)| Arc::clone(leg))
                .collect(),
            legs: legs.into_iter().map(|(_, leg)| leg).collect(),
            next: AtomicUsize::new(0),
            events: tokio::sync::Mutex::new(rx),
            readers,
            eof: AtomicBool::new(false),
        }
    }

    pub fn leg_count(&self) -> usize {
        self.legs.len()
    }
}

#[async_trait]
impl MsgStream for MergedStream {
    async fn send(&self, msg: Bytes) -> std::result::Result<(), TransportError> {
        if self.senders.is_empty() {
            return Err(TransportError::Closed);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index].send(msg).await
    }

    async fn recv(&self) -> std::result::Result<Option<Bytes>, TransportError> {
        if self.eof.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(LegEvent::Message(msg)) => Ok(Some(msg)),
            Some(LegEvent::Failed(reason)) => Err(TransportError::Disconnected(reason)),
            Some(LegEvent::Eof) | None => {
                self.eof.store(true, Ordering::Release);
                Ok(None)
            }
        }
    }

    async fn shutdown_send(&self) -> std::result::Result<(), TransportError> {
        for leg in &self.senders {
            leg.shutdown_send().await?;
        }
        Ok(())
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        for reader in &self.readers {
            reader.abort();
        }
        for leg in &self.legs {
            let _ = leg.close().await;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl Drop for MergedStream {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Result of parking one leg.
#[derive(Debug)]
pub enum Admission<T> {
    /// More legs are needed. `first` is set for the leg that created the
    /// session; `generation` identifies it for [`ImuxTable::expire`].
    Pending { generation: u64, first: bool },
    /// The session is complete; legs in index order.
    Complete(Vec<T>),
}

struct PendingSession<T> {
    shape: (u16, u16, u16),
    slots: Vec<Option<T>>,
    filled: usize,
    generation: u64,
}

/// Server-side slot table of incomplete IMUX sessions.
///
/// Each slot is filled at most once; a session completes exactly once.
pub struct ImuxTable<T = BoxMsgStream> {
    pending: HashMap<String, PendingSession<T>>,
    next_generation: u64,
}

impl<T> Default for ImuxTable<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<T> ImuxTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_sessions(&self) -> usize {
        self.pending.len()
    }

    pub fn admit(&mut self, leg: &ImuxLeg, stream: T) -> Result<Admission<T>> {
        let total = leg.total();
        let index = leg.index as usize;
        if index >= total {
            return Err(PeerError::Imux(format!(
                "leg index {index} out of range for {total} legs"
            )));
        }

        let shape = (leg.ws, leg.wsso, leg.http);
        let first = !self.pending.contains_key(&leg.session_id);
        if first {
            self.next_generation += 1;
            let mut slots = Vec::with_capacity(total);
            slots.resize_with(total, || None);
            self.pending.insert(
                leg.session_id.clone(),
                PendingSession {
                    shape,
                    slots,
                    filled: 0,
                    generation: self.next_generation,
                },
            );
        }

        let Some(session) = self.pending.get_mut(&leg.session_id) else {
            return Err(PeerError::Imux("pending session vanished".to_string()));
        };
        if session.shape != shape {
            self.pending.remove(&leg.session_id);
            return Err(PeerError::Imux(format!(
                "session {} legs disagree on leg counts",
                leg.session_id
            )));
        }
        if session.slots[index].is_some() {
            self.pending.remove(&leg.session_id);
            return Err(PeerError::DuplicateLeg {
                session: leg.session_id.clone(),
                index: leg.index,
            });
        }

        session.slots[index] = Some(stream);
        session.filled += 1;
        if session.filled < total {
            return Ok(Admission::Pending {
                generation: session.generation,
                first,
            });
        }

        match self.pending.remove(&leg.session_id) {
            Some(done) => Ok(Admission::Complete(done.slots.into_iter().flatten().collect())),
            None => Err(PeerError::Imux("pending session vanished".to_string())),
        }
    }

    /// Drop a still-pending session if it is the same one that was created
    /// with `generation`. Returns the legs it was holding.
    pub fn expire(&mut self, session_id: &str, generation: u64) -> Option<Vec<T>> {
        match self.pending.get(session_id) {
            Some(session) if session.generation == generation => self
                .pending
                .remove(session_id)
                .map(|s| s.slots.into_iter().flatten().collect()),
            _ => None,
        }
    }
}

/// Shared [`ImuxTable`] with a completion deadline per session.
pub struct ImuxRegistry {
    table: Arc<Mutex<ImuxTable>>,
    deadline: Duration,
}

impl Default for ImuxRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_IMUX_DEADLINE)
    }
}

impl ImuxRegistry {
    pub fn new(deadline: Duration) -> Self {
        Self {
            table: Arc::default(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn pending_sessions(&self) -> usize {
        lock(&self.table).pending_sessions()
    }

    /// Park `stream` as one leg. Returns every leg, in index order, once the
    /// session is complete.
    pub fn admit(&self, leg: &ImuxLeg, stream: BoxMsgStream) -> Result<Option<Vec<BoxMsgStream>>> {
        let admission = lock(&self.table).admit(leg, stream)?;
        match admission {
            Admission::Complete(legs) => Ok(Some(legs)),
            Admission::Pending { generation, first } => {
                if first {
                    self.arm_deadline(leg.session_id.clone(), generation);
                }
                Ok(None)
            }
        }
    }

    fn arm_deadline(&self, session_id: String, generation: u64) {
        let table = Arc::clone(&self.table);
        let deadline = self.deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let expired = lock(&table).expire(&session_id, generation);
            if let Some(legs) = expired {
                warn!(
                    session = %session_id,
                    legs = legs.len(),
                    ?deadline,
                    "imux session incomplete at deadline, dropping legs"
                );
                for leg in legs {
                    let _ = leg.close().await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use tunplex_transport::{pipe, MemoryStream};

    use super::*;

    fn leg(sid: &str, ws: u16, index: u16) -> ImuxLeg {
        ImuxLeg {
            session_id: sid.to_string(),
            ws,
            index,
            wsso: 0,
            http: 0,
        }
    }

    #[test]
    fn plan_orders_and_validates_legs() {
        let plan = ImuxPlan::new(1, 2, 1);
        assert_eq!(plan.total(), 4);
        assert_eq!(
            plan.legs().collect::<Vec<_>>(),
            vec![
                LegKind::Duplex,
                LegKind::SendOnly,
                LegKind::SendOnly,
                LegKind::RecvOnly
            ]
        );
        assert_eq!(plan.kind_at(4), None);
        assert!(plan.validate().is_ok());

        assert!(ImuxPlan::new(0, 2, 0).validate().is_err());
        assert!(ImuxPlan::new(0, 0, 3).validate().is_err());
        assert!(ImuxPlan::new(0, 1, 1).validate().is_ok());
        assert!(!ImuxPlan::default().is_enabled());
    }

    #[test]
    fn inverted_swaps_direction() {
        assert_eq!(LegKind::SendOnly.inverted(), LegKind::RecvOnly);
        assert_eq!(LegKind::RecvOnly.inverted(), LegKind::SendOnly);
        assert_eq!(LegKind::Duplex.inverted(), LegKind::Duplex);
    }

    #[test]
    fn table_completes_exactly_once_in_index_order() {
        let mut table = ImuxTable::new();
        assert!(matches!(
            table.admit(&leg("s1", 3, 2), "c").unwrap(),
            Admission::Pending { first: true, .. }
        ));
        assert!(matches!(
            table.admit(&leg("s1", 3, 0), "a").unwrap(),
            Admission::Pending { first: false, .. }
        ));
        match table.admit(&leg("s1", 3, 1), "b").unwrap() {
            Admission::Complete(legs) => assert_eq!(legs, vec!["a", "b", "c"]),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(table.pending_sessions(), 0);

        // A late straggler starts a fresh session rather than reviving the old one.
        assert!(matches!(
            table.admit(&leg("s1", 3, 1), "late").unwrap(),
            Admission::Pending { first: true, .. }
        ));
    }

    #[test]
    fn duplicate_index_abandons_the_session() {
        let mut table = ImuxTable::new();
        table.admit(&leg("s2", 2, 0), 1).unwrap();
        let err = table.admit(&leg("s2", 2, 0), 2).unwrap_err();
        assert!(matches!(err, PeerError::DuplicateLeg { index: 0, .. }));
        assert_eq!(table.pending_sessions(), 0);
    }

    #[test]
    fn rejects_out_of_range_and_mismatched_legs() {
        let mut table = ImuxTable::new();
        assert!(table.admit(&leg("s3", 2, 2), 0).is_err());

        table.admit(&leg("s3", 2, 0), 0).unwrap();
        assert!(table.admit(&leg("s3", 3, 1), 1).is_err());
        assert_eq!(table.pending_sessions(), 0);
    }

    #[test]
    fn expire_only_matches_its_generation() {
        let mut table = ImuxTable::new();
        let Admission::Pending { generation, .. } = table.admit(&leg("s4", 2, 0), 'x').unwrap()
        else {
            panic!("expected pending");
        };
        assert!(table.expire("s4", generation + 1).is_none());
        assert_eq!(table.expire("s4", generation), Some(vec!['x']));
        assert!(table.expire("s4", generation).is_none());
    }

    /// Hands out pipe ends; the far side answers each leg's request.
    struct PipeDialer {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
        answer: bool,
        issued: Mutex<Vec<Arc<MemoryStream>>>,
        far_tx: mpsc::UnboundedSender<(LegKind, MemoryStream)>,
    }

    impl PipeDialer {
        fn new(
            fail_on_call: Option<usize>,
            answer: bool,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<(LegKind, MemoryStream)>) {
            let (far_tx, far_rx) = mpsc::unbounded_channel();
            let dialer = Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_on_call,
                answer,
                issued: Mutex::new(Vec::new()),
                far_tx,
            });
            (dialer, far_rx)
        }

        fn issued(&self) -> Vec<Arc<MemoryStream>> {
            lock(&self.issued).clone()
        }
    }

    #[async_trait]
    impl LegDialer for PipeDialer {
        async fn dial(&self, kind: LegKind) -> Result<BoxMsgStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(call) == self.fail_on_call {
                return Err(PeerError::Imux("dial refused".to_string()));
            }
            let (near, far) = pipe();
            let near = Arc::new(near);
            lock(&self.issued).push(Arc::clone(&near));

            let answer = self.answer;
            let far_tx = self.far_tx.clone();
            tokio::spawn(async move {
                let Ok(Some(msg)) = far.recv().await else {
                    return;
                };
                let request = Request::decode(&msg).unwrap();
                assert!(matches!(request.command, Command::Imux(_)));
                if answer {
                    let ok = Reply::ok(Destination::unspecified()).encode().unwrap();
                    far.send(ok).await.unwrap();
                }
                let _ = far_tx.send((kind, far));
            });
            Ok(near)
        }
    }

    #[tokio::test]
    async fn failed_leg_closes_every_opened_leg() {
        let (dialer, _far) = PipeDialer::new(Some(1), true);
        let plan = ImuxPlan::new(2, 0, 0).with_delay(Duration::from_millis(30));

        let err = bootstrap(
            dialer.clone(),
            plan,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(&err, PeerError::Imux(reason) if reason == "dial refused"));
        let issued = dialer.issued();
        assert_eq!(issued.len(), 1);
        assert!(issued.iter().all(|leg| leg.is_closed()));
    }

    #[tokio::test]
    async fn cancellation_aborts_bootstrap() {
        let (dialer, _far) = PipeDialer::new(None, false);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = bootstrap(
            dialer.clone(),
            ImuxPlan::new(2, 0, 0),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, PeerError::Cancelled));
        assert!(dialer.issued().iter().all(|leg| leg.is_closed()));
    }

    #[tokio::test]
    async fn merged_stream_spreads_sends_and_collects_receives() {
        let (dialer, mut far_rx) = PipeDialer::new(None, true);
        let merged = bootstrap(
            dialer,
            ImuxPlan::new(1, 1, 1),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(merged.leg_count(), 3);

        let mut far = HashMap::new();
        for _ in 0..3 {
            let (kind, stream) = far_rx.recv().await.unwrap();
            far.insert(kind, stream);
        }

        merged.send(Bytes::from_static(b"one")).await.unwrap();
        merged.send(Bytes::from_static(b"two")).await.unwrap();
        let duplex = far[&LegKind::Duplex].recv().await.unwrap().unwrap();
        let send_only = far[&LegKind::SendOnly].recv().await.unwrap().unwrap();
        let mut got = vec![duplex, send_only];
        got.sort();
        assert_eq!(got, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

        far[&LegKind::RecvOnly]
            .send(Bytes::from_static(b"down"))
            .await
            .unwrap();
        assert_eq!(merged.recv().await.unwrap().unwrap().as_ref(), b"down");

        far[&LegKind::Duplex].shutdown_send().await.unwrap();
        assert!(merged.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registry_drops_incomplete_sessions_at_deadline() {
        let registry = ImuxRegistry::new(Duration::from_millis(20));
        let (near, far) = pipe();
        let near = Arc::new(near);
        let parked = registry.admit(&leg("s5", 2, 0), near.clone()).unwrap();
        assert!(parked.is_none());
        assert_eq!(registry.pending_sessions(), 1);

        assert!(far.recv().await.unwrap().is_none());
        assert!(near.is_closed());
        assert_eq!(registry.pending_sessions(), 0);
    }
}
