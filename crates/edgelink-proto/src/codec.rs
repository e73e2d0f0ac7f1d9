//! Length-delimited codec for control-stream RPC messages
//!
//! Format: `[length: u32][payload: bincode-serialized RpcMessage]`.

use crate::messages::RpcMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// RPC message codec
pub struct RpcCodec;

impl RpcCodec {
    /// Maximum serialized message size (1MB). Control messages are small;
    /// anything larger indicates a desynced stream.
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    pub fn encode(msg: &RpcMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode one message, consuming its bytes. `Ok(None)` means more data
    /// is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<RpcMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }
        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);
        let msg: RpcMessage = bincode::deserialize(&msg_bytes)?;
        Ok(Some(msg))
    }
}
