//! Per-client session lifecycle.
//!
//! Each connection runs two tasks after the handshake: a reader that owns
//! inbound I/O on the socket and a writer that owns all outbound I/O,
//! draining a bounded in-memory queue. The queue is the only way any other
//! task reaches the connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use relay_core::{read_frame, write_frame, Frame, FrameType, RelayConfig, TokenBucket};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::router::Router;

/// Outbound queue depth. Overflow drops the new frame rather than
/// blocking, which is the back-pressure against a stalled client.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// A live, authenticated client connection.
pub struct Session {
    id: Uuid,
    peer_id: String,
    remote: SocketAddr,
    /// Taken on close so enqueue and close exclude each other and close is
    /// idempotent; dropping the sender terminates the writer task.
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    bucket: Mutex<TokenBucket>,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(
        peer_id: String,
        remote: SocketAddr,
        bucket: TokenBucket,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            peer_id,
            remote,
            outbound: Mutex::new(Some(tx)),
            bucket: Mutex::new(bucket),
        });
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Non-blocking enqueue of an outbound frame.
    ///
    /// Returns false when the session is closed or its queue is full; the
    /// frame is dropped in both cases.
    pub fn enqueue(&self, frame: Frame) -> bool {
        let outbound = self.outbound.lock().expect("outbound lock poisoned");
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(peer = %self.peer_id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Consult the per-session token bucket.
    pub fn try_admit(&self) -> bool {
        self.bucket.lock().expect("bucket lock poisoned").try_acquire()
    }

    /// Idempotent close. Guarantees the writer task terminates once the
    /// already-queued frames are drained.
    pub fn close(&self) {
        self.outbound.lock().expect("outbound lock poisoned").take();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().expect("outbound lock poisoned").is_none()
    }
}

/// Drain the outbound queue onto the connection's write half.
///
/// Sole owner of outbound I/O. Ends when the queue closes or a write
/// fails; a write failure also closes the session so no further frames
/// are queued.
pub async fn run_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Frame>, session: Arc<Session>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(peer = %session.peer_id(), "write failed: {e}");
            session.close();
            break;
        }
    }
}

/// Drive inbound frames until the client disconnects, times out, or
/// violates the protocol.
pub async fn run_reader<R>(
    mut reader: R,
    session: Arc<Session>,
    router: Arc<Router>,
    config: Arc<RelayConfig>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match timeout(
            config.keepalive_timeout(),
            read_frame(&mut reader, config.max_packet_size),
        )
        .await
        {
            Err(_) => {
                debug!(peer = %session.peer_id(), "keepalive timeout");
                break;
            }
            Ok(Err(e)) => {
                debug!(peer = %session.peer_id(), "read failed: {e}");
                break;
            }
            Ok(Ok(frame)) => frame,
        };

        match frame.frame_type {
            FrameType::Data => {
                if !session.try_admit() {
                    debug!(peer = %session.peer_id(), "client rate limit, dropping packet");
                    continue;
                }
                if !router.admit_global() {
                    debug!(peer = %session.peer_id(), "global rate limit, dropping packet");
                    continue;
                }
                router.route_from_client(&session, frame.payload).await;
            }
            FrameType::Ping => {
                session.enqueue(Frame::empty(FrameType::Pong));
            }
            other => {
                warn!(peer = %session.peer_id(), "unexpected frame {other:?} on established session");
            }
        }
    }
}
