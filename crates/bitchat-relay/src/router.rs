//! Central routing hub.
//!
//! Everything a packet can do passes through here: deduplication, the
//! store-and-forward buffer, fan-out to local sessions, and emission onto
//! the mesh. Payloads are opaque; routing never looks inside them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use relay_core::{packet_hash, Deduplicator, Frame, FrameType, PacketBuffer, RelayConfig, TokenBucket};
use tracing::debug;
use uuid::Uuid;

use crate::mesh::MeshLink;
use crate::session::Session;

pub struct Router {
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    dedup: Deduplicator,
    buffer: PacketBuffer,
    global_bucket: Mutex<TokenBucket>,
    /// Attached after startup when the mesh came up; absent in standalone
    /// mode.
    mesh: OnceLock<Arc<MeshLink>>,
}

impl Router {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            dedup: Deduplicator::new(config.dedup_max_entries),
            buffer: PacketBuffer::new(config.buffer_size),
            global_bucket: Mutex::new(TokenBucket::new(
                config.global_packets_per_sec,
                config.global_burst_size,
            )),
            mesh: OnceLock::new(),
        }
    }

    pub fn attach_mesh(&self, mesh: Arc<MeshLink>) {
        let _ = self.mesh.set(mesh);
    }

    /// Register a session and catch it up with every buffered packet,
    /// oldest first. Buffered delivery happens synchronously here, so it
    /// precedes any live packet routed afterwards.
    pub fn add_session(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .expect("session set poisoned")
            .insert(session.id(), session.clone());

        for packet in self.buffer.snapshot() {
            session.enqueue(Frame::new(FrameType::Data, packet));
        }
    }

    /// Idempotent removal.
    pub fn remove_session(&self, id: Uuid) {
        self.sessions.lock().expect("session set poisoned").remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.sessions.lock().expect("session set poisoned").len()
    }

    /// Consult the aggregate token bucket.
    pub fn admit_global(&self) -> bool {
        self.global_bucket
            .lock()
            .expect("global bucket poisoned")
            .try_acquire()
    }

    /// Packet arriving from a local client: dedup, buffer, fan out to the
    /// other local sessions, then emit onto the mesh.
    pub async fn route_from_client(&self, sender: &Session, data: Bytes) {
        if self.dedup.is_duplicate(packet_hash(&data)) {
            debug!(peer = %sender.peer_id(), "duplicate client packet dropped");
            return;
        }
        self.buffer.push(&data);

        for peer in self.snapshot() {
            if peer.id() != sender.id() {
                peer.enqueue(Frame::new(FrameType::Data, data.clone()));
            }
        }

        if let Some(mesh) = self.mesh.get() {
            mesh.send(&data).await;
        }
    }

    /// Authenticated packet arriving from the mesh: dedup, buffer, fan out
    /// to every local session.
    pub fn route_from_mesh(&self, data: Bytes) {
        if self.dedup.is_duplicate(packet_hash(&data)) {
            debug!("duplicate mesh packet dropped");
            return;
        }
        self.buffer.push(&data);

        for peer in self.snapshot() {
            peer.enqueue(Frame::new(FrameType::Data, data.clone()));
        }
    }

    /// Fan-out iterates a snapshot so the set lock is never held across
    /// enqueues or the mesh send.
    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session set poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn test_router(buffer_size: usize) -> Router {
        let config = RelayConfig {
            buffer_size,
            ..RelayConfig::default()
        };
        Router::new(&config)
    }

    fn test_session(name: &str) -> (Arc<Session>, mpsc::Receiver<Frame>) {
        Session::new(
            name.to_string(),
            SocketAddr::from(([127, 0, 0, 1], 40000)),
            TokenBucket::new(10.0, 20.0),
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.frame_type, FrameType::Data);
            out.push(frame.payload.to_vec());
        }
        out
    }

    #[tokio::test]
    async fn late_session_receives_buffered_packets_in_order() {
        let router = test_router(3);
        for p in [b"a", b"b", b"c", b"d"] {
            router.route_from_mesh(Bytes::copy_from_slice(p));
        }

        let (session, mut rx) = test_session("late");
        router.add_session(session);
        assert_eq!(
            drain(&mut rx),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[tokio::test]
    async fn client_fanout_excludes_sender() {
        let router = test_router(8);
        let (alice, mut alice_rx) = test_session("alice");
        let (bob, mut bob_rx) = test_session("bob");
        router.add_session(alice.clone());
        router.add_session(bob);

        router
            .route_from_client(&alice, Bytes::from_static(b"hi"))
            .await;

        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx), vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn duplicate_across_ingress_paths_is_suppressed() {
        let router = test_router(8);
        let (alice, _alice_rx) = test_session("alice");
        let (bob, mut bob_rx) = test_session("bob");
        router.add_session(alice.clone());
        router.add_session(bob);

        router
            .route_from_client(&alice, Bytes::from_static(b"once"))
            .await;
        router.route_from_mesh(Bytes::from_static(b"once"));

        assert_eq!(drain(&mut bob_rx), vec![b"once".to_vec()]);
    }

    #[tokio::test]
    async fn mesh_fanout_reaches_all_sessions() {
        let router = test_router(8);
        let (alice, mut alice_rx) = test_session("alice");
        let (bob, mut bob_rx) = test_session("bob");
        router.add_session(alice);
        router.add_session(bob);

        router.route_from_mesh(Bytes::from_static(b"m"));
        assert_eq!(drain(&mut alice_rx), vec![b"m".to_vec()]);
        assert_eq!(drain(&mut bob_rx), vec![b"m".to_vec()]);
    }

    #[tokio::test]
    async fn remove_session_is_idempotent() {
        let router = test_router(8);
        let (session, _rx) = test_session("gone");
        let id = session.id();
        router.add_session(session);
        assert_eq!(router.client_count(), 1);

        router.remove_session(id);
        router.remove_session(id);
        assert_eq!(router.client_count(), 0);

        router.route_from_mesh(Bytes::from_static(b"after"));
    }

    #[tokio::test]
    async fn registering_same_session_twice_keeps_one_entry() {
        let router = test_router(8);
        let (session, _rx) = test_session("dup");
        router.add_session(session.clone());
        router.add_session(session);
        assert_eq!(router.client_count(), 1);
    }

    #[tokio::test]
    async fn buffered_packets_precede_live_packets() {
        let router = test_router(8);
        router.route_from_mesh(Bytes::from_static(b"old"));

        let (session, mut rx) = test_session("late");
        router.add_session(session);
        router.route_from_mesh(Bytes::from_static(b"new"));

        assert_eq!(drain(&mut rx), vec![b"old".to_vec(), b"new".to_vec()]);
    }

    #[tokio::test]
    async fn global_bucket_enforces_burst() {
        let router = test_router(8);
        let admitted = (0..1000).filter(|_| router.admit_global()).count();
        assert_eq!(admitted, 200);
    }
}
