use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::trace;
use tunplex_transport::{BoxMsgStream, MsgStream, TransportError};

use crate::cipher::{random_salt, CipherConfig, MessageTransform, SALT_LEN};
use crate::error::CipherError;

type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<CipherError> for TransportError {
    fn from(err: CipherError) -> Self {
        TransportError::Protocol(err.to_string())
    }
}

/// Per-channel encryption over an existing message stream.
///
/// The first message in each direction is a plaintext salt; every later
/// message runs through the full chain, including checksum and compression
/// stages.
///
/// Sealing advances the chain, so a sealed message is kept until the inner
/// stream accepts it. A `send` dropped mid-flight leaves it queued, and the
/// next `send` or `shutdown_send` delivers it first.
pub struct SealedStream {
    inner: BoxMsgStream,
    cipher: CipherConfig,
    outbound: Mutex<Outbound>,
    opener: Mutex<Option<MessageTransform>>,
}

#[derive(Default)]
struct Outbound {
    sealer: Option<MessageTransform>,
    pending: Option<Bytes>,
}

impl SealedStream {
    pub fn new(inner: BoxMsgStream, cipher: CipherConfig) -> Self {
        Self {
            inner,
            cipher,
            outbound: Mutex::new(Outbound::default()),
            opener: Mutex::new(None),
        }
    }

    async fn flush(&self, out: &mut Outbound) -> TransportResult<()> {
        if let Some(msg) = &out.pending {
            self.inner.send(msg.clone()).await?;
            out.pending = None;
        }
        Ok(())
    }
}

#[async_trait]
impl MsgStream for SealedStream {
    async fn send(&self, msg: Bytes) -> TransportResult<()> {
        let mut guard = self.outbound.lock().await;
        let out = &mut *guard;
        self.flush(out).await?;
        if out.sealer.is_none() {
            let salt = random_salt();
            out.sealer = Some(self.cipher.message_transform(&salt)?);
            out.pending = Some(Bytes::copy_from_slice(&salt));
            self.flush(out).await?;
            trace!(stream = %self.inner.describe(), "sent channel salt");
        }
        if let Some(sealer) = out.sealer.as_mut() {
            out.pending = Some(sealer.seal(&msg)?);
        }
        self.flush(out).await
    }

    async fn recv(&self) -> TransportResult<Option<Bytes>> {
        let mut guard = self.opener.lock().await;
        let opener = match guard.take() {
            Some(opener) => opener,
            None => {
                let Some(salt) = self.inner.recv().await? else {
                    return Ok(None);
                };
                if salt.len() != SALT_LEN {
                    return Err(CipherError::SaltLength(salt.len()).into());
                }
                self.cipher.message_transform(&salt)?
            }
        };
        let opener = guard.insert(opener);
        match self.inner.recv().await? {
            Some(msg) => Ok(Some(opener.open(&msg)?)),
            None => Ok(None),
        }
    }

    async fn shutdown_send(&self) -> TransportResult<()> {
        let mut out = self.outbound.lock().await;
        self.flush(&mut out).await?;
        self.inner.shutdown_send().await
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }

    fn describe(&self) -> String {
        format!("sealed({})", self.inner.describe())
    }
}
