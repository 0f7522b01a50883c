//! Inter-relay mesh link.
//!
//! Signed datagrams over a UDP multicast group on the layer-2 mesh
//! interface. Outbound packets carry this relay's public key (and, in CA
//! mode, its certificate) plus an Ed25519 signature over the payload bytes
//! only — the prefix is never part of the signed data, peers depend on
//! that exact contract.
//!
//! Without a CA key the mesh runs open: any signed, non-revoked peer is
//! accepted.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use relay_core::RelayConfig;
use relay_crypto::auth::CERT_SIZE;
use relay_crypto::RelayAuth;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::router::Router;

const PUBKEY_SIZE: usize = 32;
const SIG_SIZE: usize = 64;

/// Open-mode header: `[32B pubkey][64B signature]`.
const OPEN_HEADER_SIZE: usize = PUBKEY_SIZE + SIG_SIZE;

/// CA-mode header: `[32B pubkey][64B certificate][64B signature]`.
const CA_HEADER_SIZE: usize = PUBKEY_SIZE + CERT_SIZE + SIG_SIZE;

/// Requested kernel receive buffer for the inbound socket.
const RECV_BUFFER_SIZE: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum MeshRecvError {
    #[error("datagram of {0} bytes is below the minimum header")]
    TooShort(usize),

    #[error("own multicast echo")]
    SelfEcho,

    #[error("sender {0} is REVOKED")]
    Revoked(String),

    #[error("datagram of {0} bytes cannot carry a CA certificate")]
    TruncatedCaPacket(usize),

    #[error("invalid CA cert")]
    InvalidCaCertificate,

    #[error("invalid packet signature")]
    InvalidSignature,
}

pub struct MeshLink {
    outbound: UdpSocket,
    auth: Arc<RelayAuth>,
}

impl MeshLink {
    /// Bring up both datagram endpoints on the mesh interface and spawn
    /// the receive loop. Any failure here leaves the daemon in standalone
    /// mode; the caller decides how loudly to say so.
    pub async fn start(
        config: &RelayConfig,
        auth: Arc<RelayAuth>,
        router: Arc<Router>,
    ) -> Result<Arc<Self>> {
        let iface_ip = resolve_interface_ipv4(&config.mesh_interface)?;
        let group = config.mesh_multicast;

        let outbound = outbound_socket(iface_ip, group, config.mesh_port).await?;
        let inbound = inbound_socket(iface_ip, group, config.mesh_port)?;

        info!(
            "mesh link up on {} ({iface_ip}) group {group}:{}",
            config.mesh_interface, config.mesh_port
        );

        let link = Arc::new(Self { outbound, auth });

        let recv_auth = link.auth.clone();
        let max_datagram = config.max_packet_size + CA_HEADER_SIZE;
        tokio::spawn(async move {
            receive_loop(inbound, recv_auth, router, max_datagram).await;
        });

        Ok(link)
    }

    /// Sign and emit one packet onto the mesh. Failures are logged, never
    /// retried — the gossip layer above redelivers.
    pub async fn send(&self, payload: &[u8]) {
        let datagram = encode_datagram(&self.auth, payload);
        match self.outbound.send(&datagram).await {
            Ok(_) => debug!("mesh sent {} payload bytes", payload.len()),
            Err(e) => warn!("mesh send failed: {e}"),
        }
    }
}

/// Build an outbound datagram. CA layout is used only when this relay can
/// prove its own membership (CA key configured and certificate present).
fn encode_datagram(auth: &RelayAuth, payload: &[u8]) -> Vec<u8> {
    let signature = auth.sign(payload);
    let ca_mode = auth.has_ca() && auth.has_certificate();

    let header = if ca_mode { CA_HEADER_SIZE } else { OPEN_HEADER_SIZE };
    let mut datagram = Vec::with_capacity(header + payload.len());
    datagram.extend_from_slice(&auth.public_key_bytes());
    if ca_mode {
        let cert = auth.certificate().expect("checked by ca_mode");
        datagram.extend_from_slice(cert);
    }
    datagram.extend_from_slice(&signature);
    datagram.extend_from_slice(payload);
    datagram
}

/// Authenticate an inbound datagram and return its payload.
///
/// Checks run in cost order and short-circuit: length, self-echo,
/// revocation, then certificate (CA mode) and signature.
fn authenticate<'a>(auth: &RelayAuth, datagram: &'a [u8]) -> Result<&'a [u8], MeshRecvError> {
    if datagram.len() < OPEN_HEADER_SIZE {
        return Err(MeshRecvError::TooShort(datagram.len()));
    }

    let sender: [u8; PUBKEY_SIZE] = datagram[..PUBKEY_SIZE]
        .try_into()
        .expect("length checked above");
    if auth.is_self(&sender) {
        return Err(MeshRecvError::SelfEcho);
    }
    if auth.is_revoked(&sender) {
        return Err(MeshRecvError::Revoked(hex::encode(sender)));
    }

    if auth.has_ca() {
        if datagram.len() <= CA_HEADER_SIZE {
            return Err(MeshRecvError::TruncatedCaPacket(datagram.len()));
        }
        let cert: [u8; CERT_SIZE] = datagram[PUBKEY_SIZE..PUBKEY_SIZE + CERT_SIZE]
            .try_into()
            .expect("length checked above");
        let signature: [u8; SIG_SIZE] = datagram[PUBKEY_SIZE + CERT_SIZE..CA_HEADER_SIZE]
            .try_into()
            .expect("length checked above");
        let payload = &datagram[CA_HEADER_SIZE..];

        if !auth.verify_certificate(&sender, &cert) {
            return Err(MeshRecvError::InvalidCaCertificate);
        }
        if !auth.verify(&sender, payload, &signature) {
            return Err(MeshRecvError::InvalidSignature);
        }
        Ok(payload)
    } else {
        let signature: [u8; SIG_SIZE] = datagram[PUBKEY_SIZE..OPEN_HEADER_SIZE]
            .try_into()
            .expect("length checked above");
        let payload = &datagram[OPEN_HEADER_SIZE..];

        if !auth.verify(&sender, payload, &signature) {
            return Err(MeshRecvError::InvalidSignature);
        }
        Ok(payload)
    }
}

async fn receive_loop(
    inbound: UdpSocket,
    auth: Arc<RelayAuth>,
    router: Arc<Router>,
    max_datagram: usize,
) {
    let mut buf = vec![0u8; max_datagram];
    loop {
        let (len, src) = match inbound.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("mesh receive failed: {e}");
                return;
            }
        };

        match authenticate(&auth, &buf[..len]) {
            Ok(payload) => {
                debug!("mesh received {} payload bytes from {src}", payload.len());
                router.route_from_mesh(Bytes::copy_from_slice(payload));
            }
            // The local kernel loops our own multicast back constantly.
            Err(MeshRecvError::SelfEcho) => {}
            Err(e) => debug!("mesh packet from {src} dropped: {e}"),
        }
    }
}

/// Find the IPv4 address of the mesh interface.
fn resolve_interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs().context("failed to enumerate interfaces")?;
    interfaces
        .into_iter()
        .find_map(|iface| match (iface.name == name, iface.ip()) {
            (true, IpAddr::V4(v4)) => Some(v4),
            _ => None,
        })
        .with_context(|| format!("interface {name} has no IPv4 address"))
}

/// Unicast-source socket dialed to the multicast group. Binding to the
/// interface address keeps mesh traffic off other interfaces.
async fn outbound_socket(iface_ip: Ipv4Addr, group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create outbound mesh socket")?;
    socket
        .bind(&SocketAddrV4::new(iface_ip, 0).into())
        .with_context(|| format!("failed to bind outbound mesh socket to {iface_ip}"))?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())?;
    socket
        .connect(SocketAddrV4::new(group, port))
        .await
        .with_context(|| format!("failed to dial multicast group {group}:{port}"))?;
    Ok(socket)
}

/// Group-joined receive socket with an enlarged kernel buffer.
fn inbound_socket(iface_ip: Ipv4Addr, group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create inbound mesh socket")?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        warn!("could not enlarge mesh receive buffer: {e}");
    }
    socket
        .bind(&SocketAddrV4::new(iface_ip, port).into())
        .with_context(|| format!("failed to bind inbound mesh socket to {iface_ip}:{port}"))?;
    socket
        .join_multicast_v4(&group, &iface_ip)
        .with_context(|| format!("failed to join multicast group {group}"))?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_crypto::identity::RelayIdentity;
    use relay_crypto::auth::CERT_FILE;
    use std::fs;
    use std::path::Path;

    fn open_auth(key_dir: &Path) -> Arc<RelayAuth> {
        Arc::new(
            RelayAuth::new(RelayIdentity::ephemeral(), None, key_dir, None).expect("auth"),
        )
    }

    /// An auth with a CA-signed certificate on disk.
    fn ca_auth(ca: &RelayIdentity, dir: &Path) -> Arc<RelayAuth> {
        let identity = RelayIdentity::load_or_generate(dir).expect("identity");
        let cert = ca.sign(&identity.public_key_bytes());
        fs::write(dir.join(CERT_FILE), hex::encode(cert)).expect("write cert");
        Arc::new(
            RelayAuth::new(identity, Some(&ca.public_key_hex()), dir, None).expect("auth"),
        )
    }

    #[test]
    fn open_mode_roundtrip() {
        let sender_dir = tempfile::tempdir().unwrap();
        let receiver_dir = tempfile::tempdir().unwrap();
        let sender = open_auth(sender_dir.path());
        let receiver = open_auth(receiver_dir.path());

        let datagram = encode_datagram(&sender, b"payload");
        assert_eq!(datagram.len(), OPEN_HEADER_SIZE + 7);
        assert_eq!(&datagram[..PUBKEY_SIZE], &sender.public_key_bytes());

        let payload = authenticate(&receiver, &datagram).expect("authenticate");
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn signature_covers_payload_only() {
        let sender_dir = tempfile::tempdir().unwrap();
        let sender = open_auth(sender_dir.path());

        let datagram = encode_datagram(&sender, b"payload");
        let signature: [u8; SIG_SIZE] =
            datagram[PUBKEY_SIZE..OPEN_HEADER_SIZE].try_into().unwrap();
        assert!(sender.verify(&sender.public_key_bytes(), b"payload", &signature));
        assert!(!sender.verify(&sender.public_key_bytes(), &datagram, &signature));
    }

    #[test]
    fn short_datagram_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let auth = open_auth(dir.path());
        let err = authenticate(&auth, &[0u8; OPEN_HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, MeshRecvError::TooShort(95)));
    }

    #[test]
    fn own_echo_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let auth = open_auth(dir.path());
        let datagram = encode_datagram(&auth, b"echo");
        assert!(matches!(
            authenticate(&auth, &datagram),
            Err(MeshRecvError::SelfEcho)
        ));
    }

    #[test]
    fn revoked_sender_is_discarded_before_signature_check() {
        let sender_dir = tempfile::tempdir().unwrap();
        let receiver_dir = tempfile::tempdir().unwrap();
        let sender = open_auth(sender_dir.path());

        let crl = receiver_dir.path().join("revoked.crl");
        fs::write(&crl, format!("{}\n", sender.public_key_hex())).unwrap();
        let receiver = Arc::new(
            RelayAuth::new(RelayIdentity::ephemeral(), None, receiver_dir.path(), Some(crl))
                .expect("auth"),
        );

        // Garbage signature: revocation must win before any verify cost.
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&sender.public_key_bytes());
        datagram.extend_from_slice(&[0u8; SIG_SIZE]);
        datagram.extend_from_slice(b"payload");

        assert!(matches!(
            authenticate(&receiver, &datagram),
            Err(MeshRecvError::Revoked(_))
        ));
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let sender_dir = tempfile::tempdir().unwrap();
        let receiver_dir = tempfile::tempdir().unwrap();
        let sender = open_auth(sender_dir.path());
        let receiver = open_auth(receiver_dir.path());

        let mut datagram = encode_datagram(&sender, b"payload");
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;

        assert!(matches!(
            authenticate(&receiver, &datagram),
            Err(MeshRecvError::InvalidSignature)
        ));
    }

    #[test]
    fn ca_mode_roundtrip() {
        let ca = RelayIdentity::ephemeral();
        let sender_dir = tempfile::tempdir().unwrap();
        let receiver_dir = tempfile::tempdir().unwrap();
        let sender = ca_auth(&ca, sender_dir.path());
        let receiver = ca_auth(&ca, receiver_dir.path());

        let datagram = encode_datagram(&sender, b"certified");
        assert_eq!(datagram.len(), CA_HEADER_SIZE + 9);

        let payload = authenticate(&receiver, &datagram).expect("authenticate");
        assert_eq!(payload, b"certified");
    }

    #[test]
    fn ca_receiver_rejects_uncertified_sender() {
        let ca = RelayIdentity::ephemeral();
        let rogue_ca = RelayIdentity::ephemeral();
        let sender_dir = tempfile::tempdir().unwrap();
        let receiver_dir = tempfile::tempdir().unwrap();
        // Sender certified by the wrong CA.
        let sender = ca_auth(&rogue_ca, sender_dir.path());
        let receiver = ca_auth(&ca, receiver_dir.path());

        let datagram = encode_datagram(&sender, b"certified");
        assert!(matches!(
            authenticate(&receiver, &datagram),
            Err(MeshRecvError::InvalidCaCertificate)
        ));
    }

    #[test]
    fn ca_receiver_rejects_open_length_packet() {
        let ca = RelayIdentity::ephemeral();
        let sender_dir = tempfile::tempdir().unwrap();
        let receiver_dir = tempfile::tempdir().unwrap();
        let sender = open_auth(sender_dir.path());
        let receiver = ca_auth(&ca, receiver_dir.path());

        // Open-mode datagram with a short payload fits under the CA header
        // minimum and is rejected on length alone.
        let datagram = encode_datagram(&sender, b"x");
        assert!(matches!(
            authenticate(&receiver, &datagram),
            Err(MeshRecvError::TruncatedCaPacket(_))
        ));
    }
}
