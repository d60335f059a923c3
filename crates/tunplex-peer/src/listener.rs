use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunplex_frame::{FrameConfig, FramedStream};
use tunplex_transport::TcpTransport;

use crate::dispatch::Dispatcher;
use crate::error::Result;

/// Accepts framed TCP connections and hands each one to a [`Dispatcher`].
pub struct TunnelListener {
    transport: TcpTransport,
    frame: FrameConfig,
    dispatcher: Arc<Dispatcher>,
}

impl TunnelListener {
    /// Bind to a TCP address such as `0.0.0.0:8443`.
    pub async fn bind(addr: &str, frame: FrameConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        frame.validate()?;
        let transport = TcpTransport::bind(addr).await?;
        Ok(Self {
            transport,
            frame,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr(), "tunnel listener running");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.transport.accept() => accepted,
            };
            match accepted {
                Ok((tcp, _peer)) => {
                    let stream = Arc::new(FramedStream::tcp(tcp, self.frame.clone()));
                    tokio::spawn(Arc::clone(&self.dispatcher).serve(stream));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
        info!(addr = %self.local_addr(), "tunnel listener stopped");
        Ok(())
    }
}
