//! Admission handshake: HELLO -> CHALLENGE -> SOLUTION -> ACCEPT/REJECT.
//!
//! Runs on the freshly-terminated TLS stream before a session exists. The
//! caller bounds the whole exchange with the handshake timeout. Protocol
//! violations get a REJECT with a brief reason where feasible, then the
//! connection is dropped.

use relay_core::{pow, read_frame, write_frame, Frame, FrameError, FrameType, RelayConfig, PROTOCOL_VERSION};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// HELLO payload: `[2B version][1B peer id length][peer id]`, optionally
/// followed by a 32-byte attestation hash.
const HELLO_MIN_SIZE: usize = 3;
const ATTESTATION_HASH_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("expected {expected:?} frame, got {got:?}")]
    UnexpectedFrame { expected: FrameType, got: FrameType },

    #[error("HELLO payload of {0} bytes is too short")]
    ShortHello(usize),

    #[error("peer id length {id_len} overflows {payload_len}-byte HELLO")]
    PeerIdOverflow { id_len: usize, payload_len: usize },

    #[error("unsupported protocol version {0}")]
    VersionMismatch(u16),

    #[error("client presented no attestation hash but an allowlist is configured")]
    AttestationMissing,

    #[error("client attestation hash is not in the allowlist")]
    AttestationRejected,

    #[error("SOLUTION payload of {0} bytes, expected 8")]
    BadSolutionLength(usize),

    #[error("invalid proof of work")]
    InvalidPow,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Run the server side of the handshake. Returns the client's peer id.
pub async fn perform<S>(stream: &mut S, config: &RelayConfig) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = expect_frame(stream, config, FrameType::Hello).await?;
    let payload = &hello.payload;
    if payload.len() < HELLO_MIN_SIZE {
        return Err(HandshakeError::ShortHello(payload.len()));
    }

    let version = u16::from_be_bytes([payload[0], payload[1]]);
    if version != PROTOCOL_VERSION {
        reject(stream, &format!("unsupported protocol version {version}")).await;
        return Err(HandshakeError::VersionMismatch(version));
    }

    let id_len = payload[2] as usize;
    if HELLO_MIN_SIZE + id_len > payload.len() {
        return Err(HandshakeError::PeerIdOverflow {
            id_len,
            payload_len: payload.len(),
        });
    }
    let peer_id = String::from_utf8_lossy(&payload[HELLO_MIN_SIZE..HELLO_MIN_SIZE + id_len])
        .into_owned();

    let rest = &payload[HELLO_MIN_SIZE + id_len..];
    let attestation = (rest.len() >= ATTESTATION_HASH_SIZE)
        .then(|| hex::encode(&rest[..ATTESTATION_HASH_SIZE]));

    if !config.allowed_cert_hashes.is_empty() {
        match &attestation {
            None => {
                reject(stream, "certificate hash required").await;
                return Err(HandshakeError::AttestationMissing);
            }
            Some(hash) if !config.allowed_cert_hashes.contains(hash) => {
                reject(stream, "certificate not authorized").await;
                return Err(HandshakeError::AttestationRejected);
            }
            _ => {}
        }
    }

    let nonce = pow::generate_nonce();
    let mut challenge = Vec::with_capacity(pow::NONCE_SIZE + 1);
    challenge.extend_from_slice(&nonce);
    challenge.push(config.pow_difficulty);
    write_frame(stream, &Frame::new(FrameType::Challenge, challenge)).await?;

    let solution_frame = expect_frame(stream, config, FrameType::Solution).await?;
    if solution_frame.payload.len() != 8 {
        return Err(HandshakeError::BadSolutionLength(solution_frame.payload.len()));
    }
    let mut solution_bytes = [0u8; 8];
    solution_bytes.copy_from_slice(&solution_frame.payload);
    let solution = u64::from_be_bytes(solution_bytes);

    if !pow::verify(&nonce, solution, config.pow_difficulty) {
        reject(stream, "invalid proof of work").await;
        return Err(HandshakeError::InvalidPow);
    }

    write_frame(stream, &Frame::empty(FrameType::Accept)).await?;
    Ok(peer_id)
}

async fn expect_frame<S>(
    stream: &mut S,
    config: &RelayConfig,
    expected: FrameType,
) -> Result<Frame, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = read_frame(stream, config.max_packet_size).await?;
    if frame.frame_type != expected {
        return Err(HandshakeError::UnexpectedFrame {
            expected,
            got: frame.frame_type,
        });
    }
    Ok(frame)
}

/// Best-effort REJECT; the connection is being torn down anyway.
async fn reject<S>(stream: &mut S, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    let _ = write_frame(stream, &Frame::reject(reason)).await;
}
