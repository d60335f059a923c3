//! Encrypted, multiplexed tunnels.
//!
//! tunplex carries many proxied connections over one encrypted stream, or
//! over an IMUX set of parallel TCP legs merged into one stream, and keeps
//! client sessions warm in a self-sizing pool.
//!
//! # Crate Structure
//!
//! - [`transport`]: message streams over TCP and in-memory pipes
//! - [`frame`]: length-delimited framing and composable cipher chains
//! - [`peer`]: wire codec, sessions, IMUX bootstrap, pooling and the server dispatcher

/// Re-export transport types.
pub mod transport {
    pub use tunplex_transport::*;
}

/// Re-export frame and cipher types.
pub mod frame {
    pub use tunplex_frame::*;
}

/// Re-export peer types.
pub mod peer {
    pub use tunplex_peer::*;
}
