//! Wire framing for gateway connections.
//!
//! Every frame is a 5-byte header (1-byte frame type + u32 big-endian payload
//! length) followed by a JSON payload:
//!
//! ```text
//! ┌──────┬──────────────┬─────────────────┐
//! │ type │ len (u32 BE) │ payload (JSON)  │
//! └──────┴──────────────┴─────────────────┘
//! ```
//!
//! A client opens with HELLO (bearer token), the server answers WELCOME or
//! CLOSE. After admission the client sends COMMAND frames and receives EVENT
//! frames.

use serde::{Deserialize, Serialize};

use crate::model::{ConnId, UserId};

/// Header size in bytes: 1 type byte + 4 length bytes.
pub const HEADER_LEN: usize = 5;

/// Maximum accepted payload length. Large enough for any protocol message,
/// small enough to bound a hostile peer.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client → server: authentication request, first frame on a connection
    Hello = 1,
    /// Server → client: connection admitted
    Welcome = 2,
    /// Client → server: a [`crate::protocol::ClientCommand`]
    Command = 3,
    /// Server → client: a [`crate::protocol::ServerEvent`]
    Event = 4,
    /// Either direction: connection is closing
    Close = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Hello),
            2 => Ok(FrameType::Welcome),
            3 => Ok(FrameType::Command),
            4 => Ok(FrameType::Event),
            5 => Ok(FrameType::Close),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// HELLO payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub token: String,
}

/// WELCOME payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub conn_id: ConnId,
    pub user_id: UserId,
}

/// CLOSE payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Close {
    pub code: u16,
    pub reason: String,
}

/// Encode a frame from raw payload bytes
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(frame_type as u8);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a frame from a serializable payload
pub fn encode_json<T: Serialize>(frame_type: FrameType, payload: &T) -> Vec<u8> {
    // Serialization of our own payload types cannot fail
    encode_frame(frame_type, &serde_json::to_vec(payload).unwrap())
}

/// Decode a frame header. The buffer must hold at least [`HEADER_LEN`] bytes.
///
/// Returns the frame type and the payload length that follows the header.
pub fn decode_header(buf: &[u8]) -> Result<(FrameType, usize), FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Truncated);
    }

    let frame_type = FrameType::try_from(buf[0])?;
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::Oversized(len));
    }

    Ok((frame_type, len))
}

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("truncated frame header")]
    Truncated,
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
    #[error("payload length {0} exceeds limit")]
    Oversized(usize),
    #[error("invalid frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}
