//! Channel multiplexer over one message stream.
//!
//! Every mux frame is `[id u32][kind u8][seq u32][payload]`. Sequence numbers
//! are per channel and per direction; the receiver reorders by them, so a
//! channel keeps its order even when the underlying stream is an IMUX merge
//! that can deliver messages out of order across legs.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tunplex_transport::{BoxMsgStream, MsgStream, TransportError};

use crate::error::{PeerError, Result};

const KIND_OPEN: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_FIN: u8 = 3;
const KIND_RST: u8 = 4;

const MUX_HEADER: usize = 9;
const WRITE_QUEUE: usize = 256;
const MAX_REORDER: usize = 4096;
const TOMBSTONE_CAP: usize = 65_536;

type TransportResult<T> = std::result::Result<T, TransportError>;

/// Which end of a session this side is. Decides channel id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd channel ids.
    Client,
    /// Opens even channel ids.
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn owns(self, id: u32) -> bool {
        (id % 2 == 1) == (self == Role::Client)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MuxFrame {
    id: u32,
    kind: u8,
    seq: u32,
    payload: Bytes,
}

impl MuxFrame {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MUX_HEADER + self.payload.len());
        buf.put_u32(self.id);
        buf.put_u8(self.kind);
        buf.put_u32(self.seq);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    fn decode(mut msg: Bytes) -> Option<Self> {
        if msg.len() < MUX_HEADER {
            return None;
        }
        let id = msg.get_u32();
        let kind = msg.get_u8();
        let seq = msg.get_u32();
        if !(KIND_OPEN..=KIND_RST).contains(&kind) {
            return None;
        }
        Some(Self {
            id,
            kind,
            seq,
            payload: msg,
        })
    }
}

#[derive(Debug)]
enum ChannelEvent {
    Data(Bytes),
    Fin,
    Reset,
}

struct Slot {
    local: bool,
    announced: bool,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    next_seq: u32,
    pending: BTreeMap<u32, (u8, Bytes)>,
    local_fin: bool,
    remote_fin: bool,
}

impl Slot {
    fn new(local: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            local,
            announced: local,
            tx,
            rx: Some(rx),
            next_seq: 0,
            pending: BTreeMap::new(),
            local_fin: false,
            remote_fin: false,
        }
    }
}

/// Recently retired remote ids, so stragglers cannot reopen them.
#[derive(Default)]
struct Tombstones {
    order: VecDeque<u32>,
    set: HashSet<u32>,
}

impl Tombstones {
    fn insert(&mut self, id: u32) {
        if self.set.insert(id) {
            self.order.push_back(id);
            if self.order.len() > TOMBSTONE_CAP {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    fn contains(&self, id: u32) -> bool {
        self.set.contains(&id)
    }
}

struct MuxState {
    next_id: u32,
    slots: HashMap<u32, Slot>,
    tombstones: Tombstones,
    accept_tx: Option<mpsc::UnboundedSender<Channel>>,
}

impl MuxState {
    fn retire(&mut self, id: u32, role: Role) {
        if self.slots.remove(&id).is_some() && !role.owns(id) {
            self.tombstones.insert(id);
        }
    }
}

struct MuxShared {
    label: String,
    role: Role,
    stream: BoxMsgStream,
    write_tx: mpsc::Sender<Bytes>,
    state: Mutex<MuxState>,
    shutdown: CancellationToken,
    reason: OnceLock<String>,
}

impl MuxShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, MuxState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn terminate(&self, reason: &str) {
        if self.reason.set(reason.to_string()).is_ok() {
            debug!(mux = %self.label, reason, "multiplexer shutting down");
        }
        self.shutdown.cancel();
        let mut state = self.lock();
        state.slots.clear();
        state.accept_tx = None;
    }

    fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| "closed".to_string())
    }

    async fn write(&self, frame: MuxFrame) -> TransportResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Disconnected(self.reason()));
        }
        self.write_tx
            .send(frame.encode())
            .await
            .map_err(|_| TransportError::Disconnected(self.reason()))
    }

    fn try_write(&self, frame: MuxFrame) {
        if self.write_tx.try_send(frame.encode()).is_err() {
            trace!(mux = %self.label, "dropped control frame on full or closed queue");
        }
    }

    /// Route one inbound frame. An error is fatal to the whole mux.
    fn route(self: &Arc<Self>, frame: MuxFrame) -> std::result::Result<(), String> {
        let mut state = self.lock();
        if state.tombstones.contains(frame.id) {
            return Ok(());
        }

        if !state.slots.contains_key(&frame.id) {
            if self.role.owns(frame.id) {
                trace!(mux = %self.label, id = frame.id, "frame for retired local channel");
                return Ok(());
            }
            state.slots.insert(frame.id, Slot::new(false));
        }

        let Some(slot) = state.slots.get_mut(&frame.id) else {
            return Ok(());
        };
        if frame.seq < slot.next_seq {
            return Ok(());
        }
        slot.pending.insert(frame.seq, (frame.kind, frame.payload));
        if slot.pending.len() > MAX_REORDER {
            return Err(format!("channel {} reorder window exceeded", frame.id));
        }

        let mut announce = None;
        let mut retire = false;
        while let Some((kind, payload)) = slot.pending.remove(&slot.next_seq) {
            slot.next_seq = slot.next_seq.wrapping_add(1);
            match kind {
                KIND_OPEN if !slot.local && !slot.announced => {
                    slot.announced = true;
                    announce = slot.rx.take();
                }
                KIND_OPEN => {}
                KIND_DATA => {
                    let _ = slot.tx.send(ChannelEvent::Data(payload));
                }
                KIND_FIN => {
                    slot.remote_fin = true;
                    let _ = slot.tx.send(ChannelEvent::Fin);
                    if slot.local_fin {
                        retire = true;
                    }
                }
                _ => {
                    let _ = slot.tx.send(ChannelEvent::Reset);
                    retire = true;
                    break;
                }
            }
        }

        if retire {
            state.retire(frame.id, self.role);
        }

        if let Some(rx) = announce {
            let channel = Channel::new(frame.id, Arc::clone(self), rx, 0);
            let delivered = match state.accept_tx.as_ref() {
                Some(tx) => tx.send(channel).is_ok(),
                None => false,
            };
            if !delivered {
                state.retire(frame.id, self.role);
            }
        }
        Ok(())
    }
}

/// Splits one message stream into many ordered channels.
pub struct Mux {
    shared: Arc<MuxShared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Channel>>,
}

impl Mux {
    /// Start reader and writer tasks over `stream`.
    pub fn start(stream: BoxMsgStream, role: Role) -> Self {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MuxShared {
            label: stream.describe(),
            role,
            stream,
            write_tx,
            state: Mutex::new(MuxState {
                next_id: role.first_id(),
                slots: HashMap::new(),
                tombstones: Tombstones::default(),
                accept_tx: Some(accept_tx),
            }),
            shutdown: CancellationToken::new(),
            reason: OnceLock::new(),
        });

        tokio::spawn(write_loop(Arc::clone(&shared), write_rx));
        tokio::spawn(read_loop(Arc::clone(&shared)));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open a new outbound channel.
    pub async fn open(&self) -> Result<Channel> {
        let (id, rx) = {
            let mut state = self.shared.lock();
            if self.shared.shutdown.is_cancelled() {
                return Err(PeerError::SessionClosed(self.shared.reason()));
            }
            let id = state.next_id;
            state.next_id = id
                .checked_add(2)
                .ok_or_else(|| PeerError::SessionClosed("channel ids exhausted".to_string()))?;
            let mut slot = Slot::new(true);
            let rx = slot.rx.take();
            state.slots.insert(id, slot);
            (id, rx)
        };
        let Some(rx) = rx else {
            return Err(PeerError::SessionClosed("channel setup failed".to_string()));
        };

        let channel = Channel::new(id, Arc::clone(&self.shared), rx, 1);
        self.shared
            .write(MuxFrame {
                id,
                kind: KIND_OPEN,
                seq: 0,
                payload: Bytes::new(),
            })
            .await?;
        trace!(mux = %self.shared.label, id, "opened channel");
        Ok(channel)
    }

    /// Wait for the next channel opened by the peer.
    ///
    /// Returns `None` once the multiplexer has shut down.
    pub async fn accept(&self) -> Option<Channel> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            ch = rx.recv() => ch,
            _ = self.shared.shutdown.cancelled() => None,
        }
    }

    /// (local, remote) channels currently open.
    pub fn channel_counts(&self) -> (usize, usize) {
        let state = self.shared.lock();
        state.slots.values().fold((0, 0), |(l, r), slot| match slot {
            s if s.local => (l + 1, r),
            s if s.announced => (l, r + 1),
            _ => (l, r),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolve when the multiplexer shuts down, with the reason.
    pub async fn closed(&self) -> String {
        self.shared.shutdown.cancelled().await;
        self.shared.reason()
    }

    /// Tear everything down: all channels fail and the stream is closed.
    pub async fn close(&self, reason: &str) {
        self.shared.terminate(reason);
        if let Err(e) = self.shared.stream.close().await {
            debug!(mux = %self.shared.label, error = %e, "stream close failed");
        }
    }

    pub fn describe(&self) -> &str {
        &self.shared.label
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shared.terminate("multiplexer dropped");
    }
}

async fn write_loop(shared: Arc<MuxShared>, mut rx: mpsc::Receiver<Bytes>) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else { break };
        if let Err(e) = shared.stream.send(msg).await {
            shared.terminate(&format!("write failed: {e}"));
            break;
        }
    }
}

async fn read_loop(shared: Arc<MuxShared>) {
    loop {
        let res = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            res = shared.stream.recv() => res,
        };
        match res {
            Ok(Some(msg)) => {
                let Some(frame) = MuxFrame::decode(msg) else {
                    warn!(mux = %shared.label, "malformed multiplexer frame");
                    shared.terminate("malformed multiplexer frame");
                    break;
                };
                if let Err(reason) = shared.route(frame) {
                    warn!(mux = %shared.label, %reason, "multiplexer protocol violation");
                    shared.terminate(&reason);
                    break;
                }
            }
            Ok(None) => {
                shared.terminate("peer closed the stream");
                break;
            }
            Err(e) => {
                shared.terminate(&e.to_string());
                break;
            }
        }
    }
    if let Err(e) = shared.stream.close().await {
        trace!(mux = %shared.label, error = %e, "stream close after shutdown");
    }
}

/// One ordered logical pipe inside a [`Mux`].
pub struct Channel {
    id: u32,
    shared: Arc<MuxShared>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    send_seq: tokio::sync::Mutex<u32>,
    eof: AtomicBool,
    fin_sent: AtomicBool,
    closed: AtomicBool,
}

impl Channel {
    fn new(
        id: u32,
        shared: Arc<MuxShared>,
        rx: mpsc::UnboundedReceiver<ChannelEvent>,
        first_seq: u32,
    ) -> Self {
        Self {
            id,
            shared,
            rx: tokio::sync::Mutex::new(rx),
            send_seq: tokio::sync::Mutex::new(first_seq),
            eof: AtomicBool::new(false),
            fin_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    async fn send_kind(&self, kind: u8, payload: Bytes) -> TransportResult<()> {
        let mut seq = self.send_seq.lock().await;
        self.shared
            .write(MuxFrame {
                id: self.id,
                kind,
                seq: *seq,
                payload,
            })
            .await?;
        *seq = seq.wrapping_add(1);
        Ok(())
    }

    fn retire(&self) -> bool {
        let mut state = self.shared.lock();
        let present = state.slots.contains_key(&self.id);
        state.retire(self.id, self.shared.role);
        present
    }
}

#[async_trait]
impl MsgStream for Channel {
    async fn send(&self, msg: Bytes) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) || self.fin_sent.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.send_kind(KIND_DATA, msg).await
    }

    async fn recv(&self) -> TransportResult<Option<Bytes>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.eof.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(ChannelEvent::Data(msg)) => Ok(Some(msg)),
            Some(ChannelEvent::Fin) => {
                self.eof.store(true, Ordering::Release);
                Ok(None)
            }
            Some(ChannelEvent::Reset) => Err(TransportError::Disconnected(format!(
                "channel {} reset by peer",
                self.id
            ))),
            None if self.closed.load(Ordering::Acquire) => Err(TransportError::Closed),
            None if self.shared.shutdown.is_cancelled() => {
                Err(TransportError::Disconnected(self.shared.reason()))
            }
            None => Ok(None),
        }
    }

    async fn shutdown_send(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) || self.fin_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.send_kind(KIND_FIN, Bytes::new()).await?;
        let mut state = self.shared.lock();
        let done = match state.slots.get_mut(&self.id) {
            Some(slot) => {
                slot.local_fin = true;
                slot.remote_fin
            }
            None => false,
        };
        if done {
            state.retire(self.id, self.shared.role);
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.retire() {
            let seq = *self.send_seq.lock().await;
            let reset = MuxFrame {
                id: self.id,
                kind: KIND_RST,
                seq,
                payload: Bytes::new(),
            };
            if let Err(e) = self.shared.write(reset).await {
                trace!(id = self.id, error = %e, "reset not sent");
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}#{}", self.shared.label, self.id)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.retire() {
            let seq = *self.send_seq.get_mut();
            self.shared.try_write(MuxFrame {
                id: self.id,
                kind: KIND_RST,
                seq,
                payload: Bytes::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tunplex_transport::pipe;

    use super::*;

    fn mux_pair() -> (Mux, Mux) {
        let (a, b) = pipe();
        (
            Mux::start(Arc::new(a), Role::Client),
            Mux::start(Arc::new(b), Role::Server),
        )
    }

    #[test]
    fn frame_roundtrip_and_rejects_garbage() {
        let frame = MuxFrame {
            id: 7,
            kind: KIND_DATA,
            seq: 3,
            payload: Bytes::from_static(b"abc"),
        };
        assert_eq!(MuxFrame::decode(frame.encode()), Some(frame));
        assert_eq!(MuxFrame::decode(Bytes::from_static(b"short")), None);
        assert_eq!(
            MuxFrame::decode(Bytes::from_static(&[0, 0, 0, 1, 9, 0, 0, 0, 0])),
            None
        );
    }

    #[test]
    fn id_parity_follows_role() {
        assert!(Role::Client.owns(1));
        assert!(!Role::Client.owns(2));
        assert!(Role::Server.owns(2));
        assert!(!Role::Server.owns(3));
    }

    #[tokio::test]
    async fn open_accept_and_exchange() {
        let (client, server) = mux_pair();
        let a = client.open().await.unwrap();
        assert_eq!(a.id(), 1);
        a.send(Bytes::from_static(b"hello")).await.unwrap();

        let b = server.accept().await.unwrap();
        assert_eq!(b.id(), 1);
        assert_eq!(b.recv().await.unwrap().unwrap().as_ref(), b"hello");

        b.send(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap().as_ref(), b"world");

        assert_eq!(client.channel_counts(), (1, 0));
        assert_eq!(server.channel_counts(), (0, 1));
    }

    #[tokio::test]
    async fn server_opened_channels_use_even_ids() {
        let (client, server) = mux_pair();
        let s = server.open().await.unwrap();
        assert_eq!(s.id(), 2);
        let c = client.accept().await.unwrap();
        assert_eq!(c.id(), 2);
    }

    #[tokio::test]
    async fn out_of_order_frames_are_reordered() {
        let (raw, b) = pipe();
        let server = Mux::start(Arc::new(b), Role::Server);

        let frame = |kind, seq, payload: &'static [u8]| {
            MuxFrame {
                id: 1,
                kind,
                seq,
                payload: Bytes::from_static(payload),
            }
            .encode()
        };
        raw.send(frame(KIND_DATA, 2, b"second")).await.unwrap();
        raw.send(frame(KIND_DATA, 1, b"first")).await.unwrap();
        raw.send(frame(KIND_OPEN, 0, b"")).await.unwrap();

        let ch = server.accept().await.unwrap();
        assert_eq!(ch.recv().await.unwrap().unwrap().as_ref(), b"first");
        assert_eq!(ch.recv().await.unwrap().unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn half_close_then_full_close() {
        let (client, server) = mux_pair();
        let a = client.open().await.unwrap();
        a.send(Bytes::from_static(b"req")).await.unwrap();
        a.shutdown_send().await.unwrap();

        let b = server.accept().await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap().as_ref(), b"req");
        assert!(b.recv().await.unwrap().is_none());
        assert!(b.recv().await.unwrap().is_none());

        b.send(Bytes::from_static(b"resp")).await.unwrap();
        b.shutdown_send().await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap().as_ref(), b"resp");
        assert!(a.recv().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.channel_counts(), (0, 0));
        assert_eq!(server.channel_counts(), (0, 0));
    }

    #[tokio::test]
    async fn close_resets_peer_only_for_that_channel() {
        let (client, server) = mux_pair();
        let a1 = client.open().await.unwrap();
        let a2 = client.open().await.unwrap();
        a1.send(Bytes::from_static(b"1")).await.unwrap();
        a2.send(Bytes::from_static(b"2")).await.unwrap();
        let b1 = server.accept().await.unwrap();
        let b2 = server.accept().await.unwrap();

        a1.close().await.unwrap();
        assert_eq!(b1.recv().await.unwrap().unwrap().as_ref(), b"1");
        assert!(matches!(
            b1.recv().await,
            Err(TransportError::Disconnected(_))
        ));

        assert_eq!(b2.recv().await.unwrap().unwrap().as_ref(), b"2");
        b2.send(Bytes::from_static(b"still here")).await.unwrap();
        assert_eq!(a2.recv().await.unwrap().unwrap().as_ref(), b"still here");
    }

    #[tokio::test]
    async fn stream_loss_fails_every_channel() {
        let (a, b) = pipe();
        let b = Arc::new(b);
        let client = Mux::start(Arc::new(a), Role::Client);
        let server = Mux::start(b.clone(), Role::Server);

        let ch = client.open().await.unwrap();
        let _peer = server.accept().await.unwrap();
        b.close().await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert!(!reason.is_empty());
        assert!(ch.recv().await.is_err());
        assert!(client.open().await.is_err());
        assert!(client.accept().await.is_none());
    }

    #[tokio::test]
    async fn dropped_channel_sends_reset() {
        let (client, server) = mux_pair();
        let a = client.open().await.unwrap();
        let b = server.accept().await.unwrap();
        drop(a);
        assert!(matches!(
            b.recv().await,
            Err(TransportError::Disconnected(_))
        ));
        assert_eq!(client.channel_counts(), (0, 0));
    }
}
