use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunplex_transport::{MsgStream, TransportError};

use crate::codec::FrameConfig;
use crate::reader::FrameReader;
use crate::writer::FrameWriter;

type TransportResult<T> = std::result::Result<T, TransportError>;

/// A byte stream carrying encrypted frames, exposed as a message stream.
///
/// Reads and writes are serialised independently, so one task can block in
/// `recv` while others send.
pub struct FramedStream<T> {
    label: String,
    reader: Mutex<Option<FrameReader<ReadHalf<T>>>>,
    writer: Mutex<Option<FrameWriter<WriteHalf<T>>>>,
    closed: CancellationToken,
}

impl<T> FramedStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap `io` with the frame codec described by `config`.
    pub fn new(io: T, config: FrameConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            label: "framed".to_string(),
            reader: Mutex::new(Some(FrameReader::with_config(read_half, config.clone()))),
            writer: Mutex::new(Some(FrameWriter::with_config(write_half, config))),
            closed: CancellationToken::new(),
        }
    }

    /// Set the label reported by `describe`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl FramedStream<TcpStream> {
    /// Wrap a TCP connection, labelling it with the peer address.
    pub fn tcp(stream: TcpStream, config: FrameConfig) -> Self {
        let label = match stream.peer_addr() {
            Ok(addr) => format!("tcp:{addr}"),
            Err(_) => "tcp".to_string(),
        };
        Self::new(stream, config).with_label(label)
    }
}

#[async_trait]
impl<T> MsgStream for FramedStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, msg: Bytes) -> TransportResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = writer.write_frame(msg) => res.map_err(TransportError::from),
        }
    }

    async fn recv(&self) -> TransportResult<Option<Bytes>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::Closed)?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = reader.read_frame() => res.map_err(TransportError::from),
        }
    }

    async fn shutdown_send(&self) -> TransportResult<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.shutdown().await.map_err(TransportError::from),
            None => Ok(()),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(label = %self.label, error = %e, "shutdown during close failed");
            }
        }
        drop(self.reader.lock().await.take());
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
