//! Frame layer for the stream multiplexer
//!
//! Every frame is `{stream_id: u32, type: u8, flags: u8, length: u24,
//! payload}` in network byte order. Stream ID 0 carries connection-level
//! frames (PING, GOAWAY, SETTINGS).

use crate::{StreamId, MAX_FRAME_PAYLOAD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    Headers = 1,
    WindowUpdate = 2,
    RstStream = 3,
    Ping = 4,
    GoAway = 5,
    Settings = 6,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Headers),
            2 => Ok(FrameType::WindowUpdate),
            3 => Ok(FrameType::RstStream),
            4 => Ok(FrameType::Ping),
            5 => Ok(FrameType::GoAway),
            6 => Ok(FrameType::Settings),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Last frame the sender will emit for this stream
    pub const END_STREAM: u8 = 0x1;
    /// The headers payload is complete (always set; continuations are not supported)
    pub const END_HEADERS: u8 = 0x4;
    /// Acknowledgement bit for PING and SETTINGS frames. Shares the bit
    /// position with END_STREAM, which never applies to those frame types.
    pub const ACK: u8 = 0x1;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_end_stream(mut self) -> Self {
        self.0 |= Self::END_STREAM;
        self
    }

    pub fn with_end_headers(mut self) -> Self {
        self.0 |= Self::END_HEADERS;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn has_end_stream(&self) -> bool {
        self.0 & Self::END_STREAM != 0
    }

    pub fn has_end_headers(&self) -> bool {
        self.0 & Self::END_HEADERS != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Malformed {0:?} payload")]
    MalformedPayload(FrameType),
}

/// A single multiplexer frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Header size: stream_id (4) + type (1) + flags (1) + length (3) = 9 bytes
    pub const HEADER_SIZE: usize = 9;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn headers(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Headers, payload)
            .with_flags(FrameFlags::new().with_end_headers())
    }

    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(credit);
        Self::new(stream_id, FrameType::WindowUpdate, payload.freeze())
    }

    pub fn rst_stream(stream_id: StreamId, error_code: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(error_code);
        Self::new(stream_id, FrameType::RstStream, payload.freeze())
    }

    pub fn ping(opaque: [u8; 8]) -> Self {
        Self::new(
            crate::CONNECTION_STREAM_ID,
            FrameType::Ping,
            Bytes::copy_from_slice(&opaque),
        )
    }

    pub fn ping_ack(opaque: Bytes) -> Self {
        Self::new(crate::CONNECTION_STREAM_ID, FrameType::Ping, opaque)
            .with_flags(FrameFlags::new().with_ack())
    }

    pub fn go_away(last_stream_id: StreamId, error_code: u32) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(last_stream_id);
        payload.put_u32(error_code);
        Self::new(crate::CONNECTION_STREAM_ID, FrameType::GoAway, payload.freeze())
    }

    pub fn settings_ack() -> Self {
        Self::new(crate::CONNECTION_STREAM_ID, FrameType::Settings, Bytes::new())
            .with_flags(FrameFlags::new().with_ack())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Credit carried by a WINDOW_UPDATE payload
    pub fn window_credit(&self) -> Result<u32, FrameError> {
        if self.payload.len() != 4 {
            return Err(FrameError::MalformedPayload(FrameType::WindowUpdate));
        }
        let mut buf = self.payload.clone();
        Ok(buf.get_u32())
    }

    /// Error code carried by an RST_STREAM payload
    pub fn rst_error_code(&self) -> Result<u32, FrameError> {
        if self.payload.len() != 4 {
            return Err(FrameError::MalformedPayload(FrameType::RstStream));
        }
        let mut buf = self.payload.clone();
        Ok(buf.get_u32())
    }

    /// Encode to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_FRAME_PAYLOAD as usize {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_uint(payload_len as u64, 3);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode one frame from the buffer, consuming its bytes.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let length = {
            let header = &buf[..Self::HEADER_SIZE];
            ((header[6] as usize) << 16) | ((header[7] as usize) << 8) | header[8] as usize
        };
        if buf.len() < Self::HEADER_SIZE + length {
            return Ok(None);
        }

        let mut header = buf.split_to(Self::HEADER_SIZE);
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = FrameFlags::from_u8(header.get_u8());
        let payload = buf.split_to(length).freeze();

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}
