//! Message-stream transport abstraction.
//!
//! Everything above this crate talks to a [`MsgStream`]: an ordered,
//! reliable sequence of whole messages with `send`, `recv`, half close and
//! hard close. Concrete physical transports (framed TCP, WebSocket, HTTP
//! chunked) and in-process pipes all look the same from here up.
//!
//! This is the lowest layer of tunplex.

pub mod error;
pub mod memory;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use memory::{pipe, MemoryStream};
pub use tcp::TcpTransport;
pub use traits::{BoxMsgStream, MsgStream};
