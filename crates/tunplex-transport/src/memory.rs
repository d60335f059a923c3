use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::traits::MsgStream;

/// One end of an in-process message pipe.
///
/// Used for loopback sessions and throughout the test suites.
#[derive(Debug)]
pub struct MemoryStream {
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: CancellationToken,
}

/// Create a connected pair of in-memory message streams.
pub fn pipe() -> (MemoryStream, MemoryStream) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryStream::new("memory-a", a_tx, b_rx),
        MemoryStream::new("memory-b", b_tx, a_rx),
    )
}

impl MemoryStream {
    fn new(
        label: &str,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            label: label.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Whether `close` has been called on this end.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn take_sender(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl MsgStream for MemoryStream {
    async fn send(&self, msg: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let guard = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| TransportError::Disconnected("peer dropped".to_string())),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                rx.close();
                Err(TransportError::Closed)
            }
            msg = rx.recv() => Ok(msg),
        }
    }

    async fn shutdown_send(&self) -> Result<()> {
        drop(self.take_sender());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        drop(self.take_sender());
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
