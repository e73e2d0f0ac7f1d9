//! Edgelink ICMP proxy
//!
//! Shuttles ICMP echo traffic between the edge and user origins without
//! raw-socket privileges. Each client-visible flow `(src, dst, echo ID)`
//! owns one unprivileged datagram ICMP socket; the kernel assigns the
//! socket a port which doubles as the on-the-wire echo identifier, so
//! replies are filtered per flow. A funnel tracker maps flows to sockets
//! and evicts idle ones.

pub mod funnel;
pub mod packet;
pub mod proxy;

pub use funnel::{Funnel, FunnelKey, FunnelTracker};
pub use packet::{
    encode_echo_reply, encode_echo_request, parse_message, EchoPacket, IcmpEcho, IcmpMessage,
};
pub use proxy::{FlowResponder, IcmpEchoFlow, IcmpProxy};

use thiserror::Error;

/// Largest datagram the response listener will read
pub const MTU: usize = 1500;

/// ICMP subsystem errors
#[derive(Debug, Error)]
pub enum IcmpError {
    /// The platform refuses unprivileged ICMP sockets; the proxy is
    /// disabled and other subsystems proceed.
    #[error("ICMP sockets unavailable: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed ICMP packet: {0}")]
    Malformed(&'static str),

    #[error("Flow is closed")]
    FlowClosed,

    #[error("Client responder is gone")]
    ResponderGone,

    #[error("Invalid IPv6 zone {0:?}: expected a numeric scope ID")]
    InvalidZone(String),
}
