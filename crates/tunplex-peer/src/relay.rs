//! Copy data between a channel and an upstream connection until both
//! directions have finished.

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use tunplex_transport::{BoxMsgStream, TransportError};

use crate::error::{PeerError, Result};

const CHUNK_SIZE: usize = 16 * 1024;

/// A bidirectional byte stream, such as an upstream TCP connection.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxByteStream = Box<dyn ByteStream>;

/// Byte counts for one finished relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Bytes moved from the channel to the other side.
    pub forwarded: u64,
    /// Bytes moved from the other side back into the channel.
    pub returned: u64,
}

/// Relay between a channel and a byte stream.
///
/// EOF on either side is propagated as a half close; the relay ends when
/// both directions are done or either fails.
pub async fn relay_io(channel: BoxMsgStream, io: BoxByteStream) -> Result<RelayStats> {
    let (mut reader, mut writer) = tokio::io::split(io);

    let forward = async {
        let mut total = 0u64;
        while let Some(msg) = channel.recv().await? {
            writer.write_all(&msg).await.map_err(TransportError::from)?;
            total += msg.len() as u64;
        }
        writer.shutdown().await.map_err(TransportError::from)?;
        Ok::<u64, PeerError>(total)
    };

    let back = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(TransportError::from)?;
            if n == 0 {
                break;
            }
            channel.send(Bytes::copy_from_slice(&buf[..n])).await?;
            total += n as u64;
        }
        channel.shutdown_send().await?;
        Ok::<u64, PeerError>(total)
    };

    let result = tokio::try_join!(forward, back);
    if let Err(e) = channel.close().await {
        trace!(error = %e, "channel close after relay");
    }
    let (forwarded, returned) = result?;
    Ok(RelayStats {
        forwarded,
        returned,
    })
}

/// Relay between two message streams, preserving message boundaries.
pub async fn relay_streams(a: BoxMsgStream, b: BoxMsgStream) -> Result<RelayStats> {
    async fn pump(from: &BoxMsgStream, to: &BoxMsgStream) -> Result<u64> {
        let mut total = 0u64;
        while let Some(msg) = from.recv().await? {
            total += msg.len() as u64;
            to.send(msg).await?;
        }
        to.shutdown_send().await?;
        Ok(total)
    }

    let result = tokio::try_join!(pump(&a, &b), pump(&b, &a));
    let _ = a.close().await;
    let _ = b.close().await;
    let (forwarded, returned) = result?;
    Ok(RelayStats {
        forwarded,
        returned,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tunplex_transport::{pipe, MsgStream};

    use super::*;

    #[tokio::test]
    async fn relay_io_moves_both_directions() {
        let (channel, client) = pipe();
        let (upstream, mut remote) = tokio::io::duplex(1024);

        let relay = tokio::spawn(relay_io(Arc::new(channel), Box::new(upstream)));

        client.send(Bytes::from_static(b"GET /")).await.unwrap();
        client.shutdown_send().await.unwrap();

        let mut got = Vec::new();
        remote.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"GET /");

        remote.write_all(b"200 OK").await.unwrap();
        remote.shutdown().await.unwrap();
        drop(remote);

        assert_eq!(client.recv().await.unwrap().unwrap().as_ref(), b"200 OK");
        assert!(client.recv().await.unwrap().is_none());

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { forwarded: 5, returned: 6 });
    }

    #[tokio::test]
    async fn relay_streams_keeps_boundaries() {
        let (a_near, a_far) = pipe();
        let (b_near, b_far) = pipe();
        let relay = tokio::spawn(relay_streams(Arc::new(a_near), Arc::new(b_near)));

        a_far.send(Bytes::from_static(b"one")).await.unwrap();
        a_far.send(Bytes::from_static(b"two")).await.unwrap();
        a_far.shutdown_send().await.unwrap();
        assert_eq!(b_far.recv().await.unwrap().unwrap().as_ref(), b"one");
        assert_eq!(b_far.recv().await.unwrap().unwrap().as_ref(), b"two");
        assert!(b_far.recv().await.unwrap().is_none());

        b_far.send(Bytes::from_static(b"back")).await.unwrap();
        b_far.shutdown_send().await.unwrap();
        assert_eq!(a_far.recv().await.unwrap().unwrap().as_ref(), b"back");

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { forwarded: 6, returned: 4 });
    }
}
