//! Edgelink Wire Protocol
//!
//! This crate defines the frame layer shared by the stream multiplexer and
//! the control-stream RPC: frame encoding/decoding, the headers payload
//! codec, and the RPC message envelope with its registration payloads.

pub mod codec;
pub mod frame;
pub mod headers;
pub mod messages;

pub use codec::{CodecError, RpcCodec};
pub use frame::{Frame, FrameError, FrameFlags, FrameType};
pub use headers::{decode_headers, encode_headers, Header, HeaderError};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Stream identifier
pub type StreamId = u32;

/// Stream ID 0 is reserved for connection-level frames (PING, GOAWAY, SETTINGS)
pub const CONNECTION_STREAM_ID: StreamId = 0;

/// Maximum frame payload length (u24 on the wire)
pub const MAX_FRAME_PAYLOAD: u32 = (1 << 24) - 1;

/// Largest DATA payload the write scheduler emits in a single frame
pub const FRAME_DATA_CAP: u32 = 16_384;
