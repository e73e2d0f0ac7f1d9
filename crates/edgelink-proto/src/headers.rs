//! HEADERS payload codec
//!
//! A headers block is `u16 count; (u16 name_len; name; u16 value_len;
//! value)*` with case-preserved names. Each direction of a stream carries at
//! most one headers block; trailers are not supported.

use crate::MAX_FRAME_PAYLOAD;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// One header pair. Names are case-preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Headers codec errors
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("Header name or value exceeds 65535 bytes")]
    FieldTooLong,

    #[error("Too many headers: {0}")]
    TooManyHeaders(usize),

    #[error("Encoded headers block exceeds the frame payload limit")]
    BlockTooLarge,

    #[error("Truncated headers block")]
    Truncated,
}

/// Encode a headers block into a HEADERS frame payload.
pub fn encode_headers(headers: &[Header]) -> Result<Bytes, HeaderError> {
    if headers.len() > u16::MAX as usize {
        return Err(HeaderError::TooManyHeaders(headers.len()));
    }

    let mut buf = BytesMut::with_capacity(2 + headers.len() * 16);
    buf.put_u16(headers.len() as u16);
    for header in headers {
        if header.name.len() > u16::MAX as usize || header.value.len() > u16::MAX as usize {
            return Err(HeaderError::FieldTooLong);
        }
        buf.put_u16(header.name.len() as u16);
        buf.put_slice(header.name.as_bytes());
        buf.put_u16(header.value.len() as u16);
        buf.put_slice(header.value.as_bytes());
    }

    if buf.len() > MAX_FRAME_PAYLOAD as usize {
        return Err(HeaderError::BlockTooLarge);
    }
    Ok(buf.freeze())
}

/// Decode a HEADERS frame payload.
pub fn decode_headers(mut payload: Bytes) -> Result<Vec<Header>, HeaderError> {
    if payload.len() < 2 {
        return Err(HeaderError::Truncated);
    }
    let count = payload.get_u16() as usize;
    let mut headers = Vec::with_capacity(count);

    for _ in 0..count {
        let name = take_field(&mut payload)?;
        let value = take_field(&mut payload)?;
        headers.push(Header { name, value });
    }
    Ok(headers)
}

fn take_field(payload: &mut Bytes) -> Result<String, HeaderError> {
    if payload.len() < 2 {
        return Err(HeaderError::Truncated);
    }
    let len = payload.get_u16() as usize;
    if payload.len() < len {
        return Err(HeaderError::Truncated);
    }
    let raw = payload.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| HeaderError::Truncated)
}
