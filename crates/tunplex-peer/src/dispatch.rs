use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use tunplex_transport::{BoxMsgStream, TcpTransport};

use crate::dns::{self, Resolver, SystemResolver};
use crate::error::Result;
use crate::imux::{ImuxPlan, ImuxRegistry, MergedStream, DEFAULT_IMUX_DEADLINE};
use crate::mux::Role;
use crate::network::NetworkRegistry;
use crate::relay::{relay_io, BoxByteStream};
use crate::session::{Session, SessionConfig};
use crate::speedtest;
use crate::wire::{status, Command, Destination, ImuxLeg, Reply, Request};

/// Opens upstream connections for `connect` requests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `destination`. Returns the byte stream and the endpoint
    /// actually reached.
    async fn connect(&self, destination: &Destination) -> Result<(BoxByteStream, Destination)>;
}

/// Plain TCP upstream connections.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(TcpTransport::DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, destination: &Destination) -> Result<(BoxByteStream, Destination)> {
        let stream = TcpTransport::connect(&destination.to_string(), self.timeout).await?;
        let endpoint = stream
            .peer_addr()
            .map(Destination::from)
            .unwrap_or_else(|_| destination.clone());
        Ok((Box::new(stream), endpoint))
    }
}

/// Answers the first Request on every inbound channel or leg.
pub struct Dispatcher {
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn Resolver>,
    imux: ImuxRegistry,
    network: NetworkRegistry,
    session_config: SessionConfig,
}

impl Dispatcher {
    pub fn new(session_config: SessionConfig) -> Self {
        Self {
            connector: Arc::new(TcpConnector::default()),
            resolver: Arc::new(SystemResolver),
            imux: ImuxRegistry::new(DEFAULT_IMUX_DEADLINE),
            network: NetworkRegistry::new(),
            session_config,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// How long a partial IMUX session may wait for its remaining legs.
    pub fn with_imux_deadline(mut self, deadline: Duration) -> Self {
        self.imux = ImuxRegistry::new(deadline);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.session_config.request_timeout = timeout;
        self
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    pub fn imux(&self) -> &ImuxRegistry {
        &self.imux
    }

    pub fn network(&self) -> &NetworkRegistry {
        &self.network
    }

    /// Read one Request from `stream` and handle it to completion.
    ///
    /// A stream that sends nothing in time, or something that does not
    /// decode, is dropped without a reply.
    pub async fn serve(self: Arc<Self>, stream: BoxMsgStream) {
        let label = stream.describe();
        let timeout = self.session_config.request_timeout;
        let first = match tokio::time::timeout(timeout, stream.recv()).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => {
                debug!(channel = %label, "closed before sending a request");
                return;
            }
            Ok(Err(e)) => {
                debug!(channel = %label, error = %e, "failed before sending a request");
                return;
            }
            Err(_) => {
                warn!(channel = %label, ?timeout, "no request received in time");
                let _ = stream.close().await;
                return;
            }
        };

        let request = match Request::decode(&first) {
            Ok(request) => request,
            Err(e) => {
                warn!(channel = %label, error = %e, "dropping channel with malformed request");
                let _ = stream.close().await;
                return;
            }
        };
        debug!(
            channel = %label,
            command = request.command.name(),
            destination = %request.destination,
            "request"
        );

        let result = match request.command.clone() {
            Command::Connect => self.handle_connect(stream, &request.destination).await,
            Command::Channels => self.handle_channels(stream).await,
            Command::Imux(leg) => self.handle_imux(stream, leg).await,
            Command::SpeedTest => speedtest::serve(&stream).await,
            Command::Dns(name) => {
                dns::serve(&stream, self.resolver.as_ref(), &name, &request.extras).await
            }
            Command::Network => {
                self.network
                    .serve(stream, self.session_config.clone())
                    .await
            }
            Command::Unsupported(raw) => {
                info!(channel = %label, command = %raw, "unsupported command");
                let sent: Result<()> = match Reply::not_supported().encode() {
                    Ok(reply) => stream.send(reply).await.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                let _ = stream.close().await;
                sent
            }
        };
        if let Err(e) = result {
            debug!(channel = %label, error = %e, "request handling ended with error");
        }
    }

    async fn handle_connect(&self, stream: BoxMsgStream, destination: &Destination) -> Result<()> {
        match self.connector.connect(destination).await {
            Ok((io, endpoint)) => {
                debug!(%destination, %endpoint, "upstream connected");
                stream.send(Reply::ok(endpoint).encode()?).await?;
                let stats = relay_io(stream, io).await?;
                debug!(
                    %destination,
                    forwarded = stats.forwarded,
                    returned = stats.returned,
                    "relay finished"
                );
                Ok(())
            }
            Err(e) => {
                info!(%destination, error = %e, "upstream connect failed");
                let reply = Reply::failure(status::FAILED, e.reason());
                let sent = stream.send(reply.encode()?).await;
                let _ = stream.close().await;
                sent.map_err(Into::into)
            }
        }
    }

    async fn handle_channels(self: &Arc<Self>, stream: BoxMsgStream) -> Result<()> {
        stream
            .send(Reply::ok(Destination::unspecified()).encode()?)
            .await?;
        let session = Session::start(
            stream,
            Role::Server,
            self.session_config.clone(),
            Some(Arc::clone(self)),
        );
        let reason = session.closed().await;
        debug!(%reason, "session ended");
        Ok(())
    }

    async fn handle_imux(self: &Arc<Self>, stream: BoxMsgStream, leg: ImuxLeg) -> Result<()> {
        let legs = match self.imux.admit(&leg, Arc::clone(&stream)) {
            Ok(Some(legs)) => legs,
            Ok(None) => {
                debug!(session = %leg.session_id, index = leg.index, "imux leg parked");
                return Ok(());
            }
            Err(e) => {
                warn!(session = %leg.session_id, index = leg.index, error = %e, "imux leg refused");
                let _ = stream.close().await;
                return Err(e);
            }
        };

        let ok = Reply::ok(Destination::unspecified()).encode()?;
        let plan = ImuxPlan::from_leg(&leg);
        let mut merged = Vec::with_capacity(legs.len());
        for (leg_stream, kind) in legs.into_iter().zip(plan.legs()) {
            leg_stream.send(ok.clone()).await?;
            merged.push((kind.inverted(), leg_stream));
        }

        info!(session = %leg.session_id, legs = merged.len(), "imux session complete");
        let stream = MergedStream::new(format!("imux:{}", leg.session_id), merged);
        let session = Session::start(
            Arc::new(stream),
            Role::Server,
            self.session_config.clone(),
            Some(Arc::clone(self)),
        );
        let reason = session.closed().await;
        debug!(session = %leg.session_id, %reason, "imux session ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tunplex_transport::{pipe, MsgStream, TransportError};

    use super::*;
    use crate::error::PeerError;

    /// Upstream that hands out in-memory duplex streams and keeps the far ends.
    #[derive(Default)]
    struct MemoryConnector {
        remotes: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, destination: &Destination) -> Result<(BoxByteStream, Destination)> {
            if destination.host == "refused.example" {
                return Err(PeerError::Transport(TransportError::Disconnected(
                    "connection refused".to_string(),
                )));
            }
            let (near, far) = tokio::io::duplex(4096);
            self.remotes.lock().unwrap().push(far);
            Ok((Box::new(near), Destination::new("198.51.100.7", destination.port)))
        }
    }

    fn dispatcher(connector: Arc<MemoryConnector>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(SessionConfig::default()).with_connector(connector))
    }

    async fn send_request(client: &impl MsgStream, request: Request) -> Reply {
        client.send(request.encode().unwrap()).await.unwrap();
        Reply::decode(&client.recv().await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn connect_replies_with_endpoint_and_relays() {
        let connector = Arc::new(MemoryConnector::default());
        let (a, client) = pipe();
        tokio::spawn(dispatcher(connector.clone()).serve(Arc::new(a)));

        let reply = send_request(&client, Request::connect(Destination::new("example.com", 80))).await;
        assert!(reply.is_ok());
        assert_eq!(reply.endpoint, Destination::new("198.51.100.7", 80));

        client.send(Bytes::from_static(b"ping")).await.unwrap();
        let mut remote = connector.remotes.lock().unwrap().pop().unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        remote.write_all(b"pong").await.unwrap();
        assert_eq!(client.recv().await.unwrap().unwrap().as_ref(), b"pong");
    }

    #[tokio::test]
    async fn failed_connect_reports_reason() {
        let (a, client) = pipe();
        tokio::spawn(dispatcher(Arc::default()).serve(Arc::new(a)));

        let reply =
            send_request(&client, Request::connect(Destination::new("refused.example", 1))).await;
        assert_eq!(reply.status, status::FAILED);
        assert!(reply.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn unknown_command_is_not_supported() {
        let (a, client) = pipe();
        tokio::spawn(dispatcher(Arc::default()).serve(Arc::new(a)));

        let request = Request::new(
            Destination::unspecified(),
            Command::Unsupported("teleport".to_string()),
        );
        let reply = send_request(&client, request).await;
        assert_eq!(reply, Reply::not_supported());
    }

    #[tokio::test]
    async fn malformed_request_gets_no_reply() {
        let (a, client) = pipe();
        tokio::spawn(dispatcher(Arc::default()).serve(Arc::new(a)));

        client.send(Bytes::from_static(&[0xFF, 0x00])).await.unwrap();
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn channels_request_starts_a_session() {
        let connector = Arc::new(MemoryConnector::default());
        let (a, b) = pipe();
        tokio::spawn(dispatcher(connector).serve(Arc::new(a)));

        let reply = send_request(&b, Request::new(Destination::unspecified(), Command::Channels)).await;
        assert!(reply.is_ok());

        let client = Session::start(Arc::new(b), Role::Client, SessionConfig::default(), None);
        let conn = client
            .connect(
                &Destination::new("inner.example", 443),
                crate::session::ConnectMode::Safe,
            )
            .await
            .unwrap();
        let reply = conn.confirmation.wait().await.unwrap();
        assert_eq!(reply.endpoint.port, 443);
        assert_eq!(client.local_channels(), 1);
    }
}
