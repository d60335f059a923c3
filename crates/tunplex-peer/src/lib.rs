//! Tunnel sessions, bootstrap and pooling.
//!
//! A client opens a [`Session`] over one framed connection (or an IMUX leg
//! set merged into one), then carries many channels over it. Each channel
//! starts with a [`Request`] and gets exactly one [`Reply`]. The server side
//! answers requests through a [`Dispatcher`]; the client side keeps warm
//! sessions in a [`ConnectionPool`].

pub mod config;
pub mod connector;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod imux;
pub mod listener;
pub mod mux;
pub mod network;
pub mod pool;
pub mod relay;
pub mod session;
pub mod speedtest;
pub mod wire;

pub use config::TunnelConfig;
pub use connector::{ClientConnector, TcpDialer};
pub use dispatch::{Connector, Dispatcher, TcpConnector};
pub use dns::{RecordType, Resolver, SystemResolver};
pub use error::{ErrorKind, PeerError, Result};
pub use imux::{ImuxPlan, ImuxRegistry, LegDialer, LegKind, MergedStream};
pub use listener::TunnelListener;
pub use mux::{Channel, Mux, Role};
pub use network::NetworkRegistry;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, SessionFactory};
pub use relay::{relay_io, relay_streams, BoxByteStream, ByteStream, RelayStats};
pub use session::{
    Confirmation, ConnectMode, Connection, Session, SessionConfig, DEFAULT_REQUEST_TIMEOUT,
};
pub use speedtest::{SpeedReport, SpeedTestPlan};
pub use wire::{status, Command, Destination, ImuxLeg, Reply, Request, WireError};
