use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// An ordered, reliable stream of whole messages.
///
/// All methods take `&self` so one stream can be shared between a reading
/// task and any number of writers. Implementations serialise their own I/O.
#[async_trait]
pub trait MsgStream: Send + Sync {
    /// Send one message.
    async fn send(&self, msg: Bytes) -> Result<()>;

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` once the peer has finished sending.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Stop sending without tearing down the receive side.
    async fn shutdown_send(&self) -> Result<()>;

    /// Close both directions. Further calls fail with `TransportError::Closed`.
    async fn close(&self) -> Result<()>;

    /// Short transport description for diagnostics.
    fn describe(&self) -> String {
        "stream".to_string()
    }
}

/// Shared, type-erased message stream.
pub type BoxMsgStream = Arc<dyn MsgStream>;
