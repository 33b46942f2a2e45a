//! Diameter Node Engine
//!
//! This crate provides the peer/application core of a Diameter (RFC 6733)
//! signaling endpoint:
//! - Peer connection lifecycle (capabilities exchange, watchdog, disconnect)
//! - Node: peer table, listeners, outbound connections, inbound routing
//! - Applications: direct or pooled request dispatch
//! - Request/answer correlation with bounded deadlines
//!
//! The wire codec in [`avp`] and [`message`] is deliberately minimal; the
//! engine only reads the routing-relevant header fields and a handful of
//! base protocol AVPs.

pub mod common;
pub mod avp;
pub mod message;
pub mod error;
pub mod config;
pub mod uri;
pub mod session;
pub mod transport;
pub mod peer;
pub mod application;
pub mod node;

pub use common::*;
pub use avp::{Avp, AvpData};
pub use message::*;
pub use error::*;
pub use config::*;
pub use uri::*;
pub use session::*;
pub use transport::*;
pub use peer::{Peer, PeerInput, PeerState, PeerStats, PeerStatsSnapshot, PeerTable};
pub use application::*;
pub use node::Node;

/// Diameter protocol version
pub const DIAMETER_VERSION: u8 = 1;

/// Default Diameter port
pub const DIAMETER_PORT: u16 = 3868;

/// Default Diameter TLS port
pub const DIAMETER_TLS_PORT: u16 = 5658;
