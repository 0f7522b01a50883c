//! Client session wire framing.
//!
//! Every message on the TLS stream is a frame:
//!
//! ```text
//!  0               1               2               3               4
//! +---------------+---------------+---------------+---------------+---------------+
//! |     Type      |                    Length (u32, BE)                           |
//! +---------------+---------------+---------------+---------------+---------------+
//! |                         Payload (Length bytes)                                |
//! +-------------------------------------------------------------------------------+
//! ```
//!
//! Wire values are fixed for interop with deployed clients.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the `[type][len]` frame header.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame types exchanged with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client introduction: version, peer id, optional attestation hash.
    Hello = 0x01,
    /// Server proof-of-work challenge: nonce + difficulty.
    Challenge = 0x02,
    /// Client proof-of-work solution.
    Solution = 0x03,
    /// Handshake accepted.
    Accept = 0x04,
    /// Handshake rejected, payload is a UTF-8 reason.
    Reject = 0x05,
    /// Opaque application packet.
    Data = 0x10,
    /// Client keepalive probe.
    Ping = 0x20,
    /// Server keepalive reply.
    Pong = 0x21,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Challenge),
            0x03 => Ok(Self::Solution),
            0x04 => Ok(Self::Accept),
            0x05 => Ok(Self::Reject),
            0x10 => Ok(Self::Data),
            0x20 => Ok(Self::Ping),
            0x21 => Ok(Self::Pong),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Frame with an empty payload (ACCEPT, PING, PONG).
    pub fn empty(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            payload: Bytes::new(),
        }
    }

    /// REJECT frame carrying a human-readable reason.
    pub fn reject(reason: &str) -> Self {
        Self::new(FrameType::Reject, Bytes::copy_from_slice(reason.as_bytes()))
    }
}

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("frame payload of {got} bytes exceeds maximum {max}")]
    Oversized { got: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one frame from `reader`.
///
/// Pulls the 5-byte header, then exactly `length` payload bytes. A length
/// above `max_payload` fails before any payload is read.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let frame_type = FrameType::try_from(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > max_payload {
        return Err(FrameError::Oversized {
            got: len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        frame_type,
        payload: Bytes::from(payload),
    })
}

/// Write one frame to `writer`.
///
/// The header and payload are assembled into a single buffer and written in
/// one call so the frame lands in one TLS record where possible.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
    buf.push(frame.frame_type as u8);
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
