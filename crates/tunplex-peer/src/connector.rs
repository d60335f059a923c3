use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunplex_frame::{FrameConfig, FramedStream};
use tunplex_transport::{BoxMsgStream, TcpTransport};

use crate::error::{PeerError, Result};
use crate::imux::{self, ImuxPlan, LegDialer, LegKind};
use crate::mux::Role;
use crate::pool::SessionFactory;
use crate::session::{Session, SessionConfig};
use crate::wire::{Command, Destination, Reply, Request};

/// Dials framed TCP connections to one server address.
///
/// Every leg kind uses the same TCP transport; the leg's direction only
/// matters to the merged stream built on top.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    frame: FrameConfig,
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>, frame: FrameConfig) -> Self {
        Self {
            addr: addr.into(),
            frame,
            timeout: TcpTransport::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn dial_stream(&self) -> Result<BoxMsgStream> {
        let tcp = TcpTransport::connect(&self.addr, self.timeout).await?;
        Ok(Arc::new(FramedStream::tcp(tcp, self.frame.clone())))
    }
}

#[async_trait]
impl LegDialer for TcpDialer {
    async fn dial(&self, kind: LegKind) -> Result<BoxMsgStream> {
        debug!(addr = %self.addr, ?kind, "dialing leg");
        self.dial_stream().await
    }
}

/// Opens client sessions to a tunnel server, either over one connection or
/// over an IMUX leg set.
pub struct ClientConnector {
    dialer: Arc<dyn LegDialer>,
    plan: ImuxPlan,
    config: SessionConfig,
}

impl ClientConnector {
    pub fn new(dialer: Arc<dyn LegDialer>, config: SessionConfig) -> Self {
        Self {
            dialer,
            plan: ImuxPlan::default(),
            config,
        }
    }

    /// Use IMUX when `plan` has any legs.
    pub fn with_imux(mut self, plan: ImuxPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Open one session, honouring `cancel` while the handshake runs.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<Arc<Session>> {
        let stream: BoxMsgStream = if self.plan.is_enabled() {
            let merged = imux::bootstrap(
                Arc::clone(&self.dialer),
                self.plan,
                self.config.request_timeout,
                cancel,
            )
            .await?;
            Arc::new(merged)
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PeerError::Cancelled),
                stream = self.open_plain() => stream?,
            }
        };
        Ok(Session::start(stream, Role::Client, self.config.clone(), None))
    }

    async fn open_plain(&self) -> Result<BoxMsgStream> {
        let stream = self.dialer.dial(LegKind::Duplex).await?;
        let result: Result<()> = async {
            let request = Request::new(Destination::unspecified(), Command::Channels);
            stream.send(request.encode()?).await?;
            let timeout = self.config.request_timeout;
            let msg = tokio::time::timeout(timeout, stream.recv())
                .await
                .map_err(|_| PeerError::Timeout(timeout))??
                .ok_or_else(|| PeerError::SessionClosed("closed before reply".to_string()))?;
            let reply = Reply::decode(&msg)?;
            if !reply.is_ok() {
                return Err(PeerError::Rejected {
                    status: reply.status,
                    message: reply.message,
                });
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => Ok(stream),
            Err(e) => {
                let _ = stream.close().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl SessionFactory for ClientConnector {
    async fn open(&self, cancel: &CancellationToken) -> Result<Arc<Session>> {
        self.connect(cancel).await
    }
}
