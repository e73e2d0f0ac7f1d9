//! Edgelink stream multiplexer
//!
//! Layers many logical bidirectional streams over a single byte transport.
//! One read-loop task owns the transport's read half and dispatches frames
//! into per-stream buffers; one write-loop task owns the write half and is
//! driven by a deduplicating ready list, emitting at most one DATA frame per
//! stream per turn for round-robin fairness. Each stream carries its own
//! adaptive receive window.

pub mod muxer;
pub mod ready_list;
pub mod shared_buffer;
pub mod stream;

pub use muxer::{Muxer, MuxerConfig};
pub use ready_list::ReadyList;
pub use shared_buffer::SharedBuffer;
pub use stream::{MuxedStream, StreamState};

use thiserror::Error;

/// Default per-stream receive window (bytes the peer may send before credit
/// is returned)
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Default ceiling for the adaptive receive window
pub const DEFAULT_MAX_WINDOW_SIZE: u32 = DEFAULT_WINDOW_SIZE << 2;

/// Default cap on concurrently open streams per muxer
pub const DEFAULT_MAX_STREAMS: usize = 1_024;

/// Stream error codes carried by RST_STREAM and GOAWAY frames
pub mod error_codes {
    pub const NO_ERROR: u32 = 0;
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INTERNAL_ERROR: u32 = 2;
    pub const FLOW_CONTROL_ERROR: u32 = 3;
    pub const STREAM_CLOSED: u32 = 5;
    pub const REFUSED_STREAM: u32 = 7;
}

/// Errors surfaced by stream reads and writes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The stream has closed; reads drain buffered data first
    #[error("end of stream")]
    EndOfStream,

    /// The peer reset the stream with the given error code
    #[error("stream reset by peer: code {0}")]
    Reset(u32),

    /// The peer overran the stream's receive buffer
    #[error("receive buffer overflow")]
    BufferOverflow,
}

/// Errors terminating a muxer or rejecting a muxer operation
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] edgelink_proto::FrameError),

    #[error("Headers error: {0}")]
    Header(#[from] edgelink_proto::HeaderError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Peer sent GOAWAY; no new streams may be opened")]
    GoAwayReceived,

    #[error("Too many open streams: {0}")]
    TooManyStreams(usize),

    #[error("Muxer is closed")]
    Closed,
}
