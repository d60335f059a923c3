use bytes::Bytes;
use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use crate::codec::{FrameConfig, FrameEncoder};
use crate::error::Result;

/// Writes complete frames to any `AsyncWrite` stream.
pub struct FrameWriter<T> {
    inner: FramedWrite<T, FrameEncoder>,
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner: FramedWrite::new(inner, FrameEncoder::new(config)),
        }
    }

    /// Encode, write and flush one frame.
    pub async fn write_frame(&mut self, payload: Bytes) -> Result<()> {
        self.inner.send(payload).await
    }

    /// Flush pending frames and shut down the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.close().await
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::codec::{FrameDecoder, HEADER_SIZE};
    use crate::error::FrameError;

    #[tokio::test]
    async fn write_single_frame() {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        writer.write_frame(Bytes::from_static(b"hello")).await.unwrap();

        let wire = writer.into_inner();
        assert_eq!(wire.len(), HEADER_SIZE + 5);

        let mut buf = BytesMut::from(wire.as_slice());
        let frame = FrameDecoder::new(FrameConfig::default())
            .decode(&mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn payload_too_large_rejected() {
        let cfg = FrameConfig::default().with_max_payload(4);
        let mut writer = FrameWriter::with_config(Vec::<u8>::new(), cfg);

        let err = writer
            .write_frame(Bytes::from_static(b"oversized"))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(writer.get_ref().is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_write_side() {
        let (left, mut right) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(left);
        writer.write_frame(Bytes::from_static(b"x")).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut all = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut right, &mut all)
            .await
            .unwrap();
        assert_eq!(all, vec![0, 0, 1, 0, b'x']);
    }
}
