use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::codec::{FrameConfig, FrameDecoder};
use crate::error::Result;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads complete frames from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct FrameReader<T> {
    inner: FramedRead<T, FrameDecoder>,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner: FramedRead::with_capacity(
                inner,
                FrameDecoder::new(config),
                INITIAL_BUFFER_CAPACITY,
            ),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream and
    /// `Err(FrameError::ConnectionClosed)` when EOF cuts a frame short.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        self.inner.next().await.transpose()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
