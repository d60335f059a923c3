use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tunplex_frame::{CipherConfig, SealedStream};
use tunplex_transport::{BoxMsgStream, MsgStream, TransportError};

use crate::dispatch::Dispatcher;
use crate::error::{PeerError, Result};
use crate::mux::{Mux, Role};
use crate::wire::{Destination, Reply, Request};

/// Default time to wait for a Reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-session behaviour.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cipher applied to every channel on top of the connection cipher.
    pub channel_cipher: Option<CipherConfig>,
    /// How long to wait for a Reply before giving up on a channel.
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_cipher: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// How `connect` treats the remote's Reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Wait for the Reply before returning.
    #[default]
    Safe,
    /// Return immediately; the Reply arrives through [`Confirmation`].
    FastOpen,
}

#[derive(Debug, Clone)]
enum Confirm {
    Pending,
    Accepted(Reply),
    Rejected { status: u8, message: String },
    Failed(String),
}

/// The outcome of a connect, possibly still in flight.
#[derive(Debug, Clone)]
pub struct Confirmation {
    rx: watch::Receiver<Confirm>,
}

impl Confirmation {
    fn resolved(state: Confirm) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    /// Wait for the Reply. Rejections surface as [`PeerError::Rejected`].
    pub async fn wait(&self) -> Result<Reply> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|s| !matches!(s, Confirm::Pending))
            .await
            .map(|s| (*s).clone())
            .unwrap_or_else(|_| Confirm::Failed("confirmation dropped".to_string()));
        match state {
            Confirm::Accepted(reply) => Ok(reply),
            Confirm::Rejected { status, message } => Err(PeerError::Rejected { status, message }),
            Confirm::Failed(reason) => Err(PeerError::SessionClosed(reason)),
            Confirm::Pending => Err(PeerError::SessionClosed("confirmation pending".to_string())),
        }
    }

    /// True once the Reply (or a failure) is known.
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.rx.borrow(), Confirm::Pending)
    }
}

/// A proxied connection opened through a session.
pub struct Connection {
    pub stream: BoxMsgStream,
    pub confirmation: Confirmation,
}

/// Channel wrapper whose reads wait for the connect confirmation.
struct ProxyStream {
    inner: BoxMsgStream,
    confirmation: Confirmation,
}

#[async_trait]
impl MsgStream for ProxyStream {
    async fn send(&self, msg: Bytes) -> std::result::Result<(), TransportError> {
        self.inner.send(msg).await
    }

    async fn recv(&self) -> std::result::Result<Option<Bytes>, TransportError> {
        if let Err(e) = self.confirmation.wait().await {
            return Err(TransportError::Disconnected(e.to_string()));
        }
        self.inner.recv().await
    }

    async fn shutdown_send(&self) -> std::result::Result<(), TransportError> {
        self.inner.shutdown_send().await
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        self.inner.close().await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// The request/reply runtime bound to one logical message stream.
///
/// A session runs until `close` is called or its stream fails. Inbound
/// channels go to the dispatcher, or are refused when there is none.
pub struct Session {
    mux: Mux,
    config: SessionConfig,
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

impl Session {
    /// Start a session over `stream`.
    pub fn start(
        stream: BoxMsgStream,
        role: Role,
        config: SessionConfig,
        handler: Option<Arc<Dispatcher>>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            mux: Mux::start(stream, role),
            config,
        });
        info!(
            stream = %session.mux.describe(),
            ?role,
            serving = handler.is_some(),
            "session started"
        );
        tokio::spawn(accept_loop(Arc::clone(&session), handler));
        session
    }

    pub fn role(&self) -> Role {
        self.mux.role()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_channels(&self) -> usize {
        self.mux.channel_counts().0
    }

    pub fn remote_channels(&self) -> usize {
        self.mux.channel_counts().1
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Resolve when the session ends, with the reason.
    pub async fn closed(&self) -> String {
        self.mux.closed().await
    }

    /// End the session and every channel in it.
    pub async fn close(&self) {
        self.mux.close("closed locally").await;
    }

    pub(crate) async fn fail(&self, reason: &str) {
        warn!(stream = %self.mux.describe(), reason, "session failed");
        self.mux.close(reason).await;
    }

    fn wrap(&self, channel: BoxMsgStream) -> BoxMsgStream {
        match &self.config.channel_cipher {
            Some(cipher) => Arc::new(SealedStream::new(channel, cipher.clone())),
            None => channel,
        }
    }

    /// Open a raw channel, sealed if a channel cipher is configured.
    pub async fn open_channel(&self) -> Result<BoxMsgStream> {
        let channel = self.mux.open().await?;
        Ok(self.wrap(Arc::new(channel)))
    }

    async fn read_reply(&self, stream: &BoxMsgStream) -> Result<Reply> {
        let timeout = self.config.request_timeout;
        let msg = match tokio::time::timeout(timeout, stream.recv()).await {
            Err(_) => return Err(PeerError::Timeout(timeout)),
            Ok(res) => res?,
        };
        let msg = msg
            .ok_or_else(|| PeerError::SessionClosed("channel closed before reply".to_string()))?;
        match Reply::decode(&msg) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.fail(&format!("bad reply: {e}")).await;
                Err(e.into())
            }
        }
    }

    /// Send `request` on a new channel and wait for its Reply.
    ///
    /// The channel is returned even when the Reply carries a failure status.
    /// Timeouts and transport errors close the channel.
    pub async fn exchange(&self, request: &Request) -> Result<(BoxMsgStream, Reply)> {
        let stream = self.open_channel().await?;
        let result: Result<Reply> = async {
            stream.send(request.encode()?).await?;
            self.read_reply(&stream).await
        }
        .await;
        match result {
            Ok(reply) => Ok((stream, reply)),
            Err(e) => {
                let _ = stream.close().await;
                Err(e)
            }
        }
    }

    /// Open a proxied connection to `destination`.
    pub async fn connect(
        self: &Arc<Self>,
        destination: &Destination,
        mode: ConnectMode,
    ) -> Result<Connection> {
        let request = Request::connect(destination.clone());
        match mode {
            ConnectMode::Safe => {
                let (stream, reply) = self.exchange(&request).await?;
                if !reply.is_ok() {
                    debug!(%destination, status = reply.status, message = %reply.message, "connect rejected");
                    let _ = stream.close().await;
                    return Err(PeerError::Rejected {
                        status: reply.status,
                        message: reply.message,
                    });
                }
                let confirmation = Confirmation::resolved(Confirm::Accepted(reply));
                Ok(Connection {
                    stream: Arc::new(ProxyStream {
                        inner: stream,
                        confirmation: confirmation.clone(),
                    }),
                    confirmation,
                })
            }
            ConnectMode::FastOpen => {
                let stream = self.open_channel().await?;
                if let Err(e) = stream.send(request.encode()?).await {
                    let _ = stream.close().await;
                    return Err(e.into());
                }

                let (tx, rx) = watch::channel(Confirm::Pending);
                let confirmation = Confirmation { rx };
                let session = Arc::clone(self);
                let reply_stream = Arc::clone(&stream);
                let destination = destination.clone();
                tokio::spawn(async move {
                    let state = match session.read_reply(&reply_stream).await {
                        Ok(reply) if reply.is_ok() => Confirm::Accepted(reply),
                        Ok(reply) => {
                            debug!(%destination, status = reply.status, message = %reply.message, "fast-open connect rejected");
                            let _ = reply_stream.close().await;
                            Confirm::Rejected {
                                status: reply.status,
                                message: reply.message,
                            }
                        }
                        Err(e) => {
                            let _ = reply_stream.close().await;
                            Confirm::Failed(e.reason())
                        }
                    };
                    let _ = tx.send(state);
                });

                Ok(Connection {
                    stream: Arc::new(ProxyStream {
                        inner: stream,
                        confirmation: confirmation.clone(),
                    }),
                    confirmation,
                })
            }
        }
    }
}

fn accept_loop(session: Arc<Session>, handler: Option<Arc<Dispatcher>>) -> BoxedTask {
    Box::pin(async move {
        while let Some(channel) = session.mux.accept().await {
            let stream = session.wrap(Arc::new(channel));
            match &handler {
                Some(handler) => {
                    tokio::spawn(Arc::clone(handler).serve(stream));
                }
                None => {
                    debug!(channel = %stream.describe(), "refusing inbound channel");
                    let _ = stream.close().await;
                }
            }
        }
        debug!(stream = %session.mux.describe(), "session accept loop finished");
    })
}

#[cfg(test)]
mod tests {
    use tunplex_transport::pipe;

    use super::*;
    use crate::wire::{status, Command};

    type PeerTask = tokio::task::JoinHandle<(Vec<Request>, Mux, Vec<crate::mux::Channel>)>;

    /// Peer that answers each new channel's Request with the next scripted Reply.
    fn scripted_peer(replies: Vec<Reply>) -> (Arc<Session>, PeerTask) {
        let (a, b) = pipe();
        let session = Session::start(Arc::new(a), Role::Client, SessionConfig::default(), None);
        let server = Mux::start(Arc::new(b), Role::Server);
        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut held = Vec::new();
            for reply in replies {
                let ch = server.accept().await.unwrap();
                let req = Request::decode(&ch.recv().await.unwrap().unwrap()).unwrap();
                seen.push(req);
                ch.send(reply.encode().unwrap()).await.unwrap();
                held.push(ch);
            }
            (seen, server, held)
        });
        (session, task)
    }

    #[tokio::test]
    async fn safe_connect_returns_reply() {
        let endpoint = Destination::new("10.1.2.3", 443);
        let (session, peer) = scripted_peer(vec![Reply::ok(endpoint.clone())]);

        let conn = session
            .connect(&Destination::new("example.com", 443), ConnectMode::Safe)
            .await
            .unwrap();
        assert!(conn.confirmation.is_resolved());
        assert_eq!(conn.confirmation.wait().await.unwrap().endpoint, endpoint);

        let (seen, _server, _held) = peer.await.unwrap();
        assert_eq!(seen[0].command, Command::Connect);
        assert_eq!(seen[0].destination, Destination::new("example.com", 443));
    }

    #[tokio::test]
    async fn rejected_connect_is_local_to_its_channel() {
        let (session, peer) = scripted_peer(vec![
            Reply::failure(7, "refused"),
            Reply::ok(Destination::unspecified()),
        ]);

        let err = session
            .connect(&Destination::new("blocked.example", 80), ConnectMode::Safe)
            .await
            .err()
            .unwrap();
        assert!(matches!(&err, PeerError::Rejected { status: 7, message } if message == "refused"));
        assert_eq!(err.to_string(), "refused");
        assert_eq!(session.local_channels(), 0);

        let ok = session
            .connect(&Destination::new("fine.example", 80), ConnectMode::Safe)
            .await;
        assert!(ok.is_ok());
        assert!(!session.is_closed());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn fast_open_confirms_later() {
        let (session, peer) = scripted_peer(vec![Reply::failure(status::FAILED, "no route")]);

        let conn = session
            .connect(&Destination::new("late.example", 80), ConnectMode::FastOpen)
            .await
            .unwrap();
        conn.stream.send(Bytes::from_static(b"early data")).await.ok();

        let err = conn.confirmation.wait().await.err().unwrap();
        assert!(matches!(err, PeerError::Rejected { status: 1, .. }));
        assert!(conn.stream.recv().await.is_err());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn garbled_reply_is_fatal_to_the_session() {
        let (a, b) = pipe();
        let session = Session::start(Arc::new(a), Role::Client, SessionConfig::default(), None);
        let server = Mux::start(Arc::new(b), Role::Server);
        tokio::spawn(async move {
            let ch = server.accept().await.unwrap();
            let _ = ch.recv().await;
            ch.send(Bytes::from_static(&[0])).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(server);
        });

        let err = session
            .connect(&Destination::new("x.example", 1), ConnectMode::Safe)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PeerError::Wire(_)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn reply_timeout_closes_only_the_channel() {
        let (a, b) = pipe();
        let config = SessionConfig {
            request_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let session = Session::start(Arc::new(a), Role::Client, config, None);
        let server = Mux::start(Arc::new(b), Role::Server);

        let err = session
            .connect(&Destination::new("slow.example", 1), ConnectMode::Safe)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PeerError::Timeout(_)));
        assert!(!session.is_closed());
        drop(server);
    }

    #[tokio::test]
    async fn inbound_channels_without_handler_are_refused() {
        let (a, b) = pipe();
        let _session = Session::start(Arc::new(a), Role::Client, SessionConfig::default(), None);
        let server = Mux::start(Arc::new(b), Role::Server);

        let ch = server.open().await.unwrap();
        ch.send(Bytes::from_static(b"hello?")).await.ok();
        assert!(ch.recv().await.is_err());
    }

    #[tokio::test]
    async fn sealed_channels_roundtrip() {
        use tunplex_frame::CipherSpec;

        let cipher = CipherConfig::new(CipherSpec::parse(&["chacha20", "crc32c"]).unwrap(), "ch").unwrap();
        let config = SessionConfig {
            channel_cipher: Some(cipher.clone()),
            ..SessionConfig::default()
        };
        let (a, b) = pipe();
        let client = Session::start(Arc::new(a), Role::Client, config.clone(), None);
        let server = Mux::start(Arc::new(b), Role::Server);

        let ch = client.open_channel().await.unwrap();
        ch.send(Bytes::from_static(b"sealed hello")).await.unwrap();

        let raw = server.accept().await.unwrap();
        let far = SealedStream::new(Arc::new(raw), cipher);
        assert_eq!(far.recv().await.unwrap().unwrap().as_ref(), b"sealed hello");
    }
}
