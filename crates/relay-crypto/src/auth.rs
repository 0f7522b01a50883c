//! Mesh packet authentication.
//!
//! Wraps the relay identity with the optional CA trust anchor, the relay's
//! own CA-issued certificate, the revocation set, and the peer certificate
//! cache. Certificate verification is positive-only memoization: a peer
//! certificate that verified once is trusted for the life of the process,
//! and revocation is the negative channel.
//!
//! Without a CA key the mesh runs open: any signed peer whose key is not
//! revoked is accepted.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;
use tracing::{info, warn};

use crate::identity::RelayIdentity;

/// File name of the relay's own CA certificate inside the key directory.
pub const CERT_FILE: &str = "relay.cert";

/// A relay certificate is a CA signature over the relay's public key.
pub const CERT_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid CA public key: {0}")]
    InvalidCaKey(String),

    #[error("failed to read CRL {path}: {source}")]
    CrlIo {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct RelayAuth {
    identity: RelayIdentity,
    ca_key: Option<VerifyingKey>,
    certificate: Option<[u8; CERT_SIZE]>,
    revoked: RwLock<HashSet<String>>,
    verified_peers: Mutex<HashSet<[u8; 32]>>,
    crl_path: Option<PathBuf>,
    crl_mtime: Mutex<Option<SystemTime>>,
}

impl RelayAuth {
    /// Assemble the trust plane around an identity.
    ///
    /// `ca_pubkey_hex` enables CA mode. The relay's own certificate is
    /// loaded from `key_dir/relay.cert` when present; a malformed
    /// certificate file is logged and skipped rather than taking the
    /// process down. The CRL, when configured, is loaded immediately.
    pub fn new(
        identity: RelayIdentity,
        ca_pubkey_hex: Option<&str>,
        key_dir: &Path,
        crl_path: Option<PathBuf>,
    ) -> Result<Self, AuthError> {
        let ca_key = match ca_pubkey_hex.filter(|s| !s.is_empty()) {
            Some(hex_key) => Some(decode_ca_key(hex_key)?),
            None => None,
        };

        let certificate = load_certificate(&key_dir.join(CERT_FILE));

        let auth = Self {
            identity,
            ca_key,
            certificate,
            revoked: RwLock::new(HashSet::new()),
            verified_peers: Mutex::new(HashSet::new()),
            crl_path,
            crl_mtime: Mutex::new(None),
        };
        auth.reload_crl_if_changed()?;
        Ok(auth)
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.identity.sign(message)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        self.identity.public_key_hex()
    }

    /// Verify `signature` over `message` under a peer's public key.
    pub fn verify(&self, peer_pubkey: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(peer_pubkey) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(signature))
            .is_ok()
    }

    /// True when `pubkey` is this relay's own key (multicast echo).
    pub fn is_self(&self, pubkey: &[u8; 32]) -> bool {
        *pubkey == self.identity.public_key_bytes()
    }

    /// Revocation lookup, done before any signature cost is paid.
    pub fn is_revoked(&self, pubkey: &[u8; 32]) -> bool {
        let revoked = self.revoked.read().expect("revocation lock poisoned");
        revoked.contains(&hex::encode(pubkey))
    }

    /// Verify a peer's CA certificate, memoizing success.
    pub fn verify_certificate(&self, peer_pubkey: &[u8; 32], certificate: &[u8; CERT_SIZE]) -> bool {
        let Some(ca_key) = &self.ca_key else {
            return false;
        };

        {
            let cache = self.verified_peers.lock().expect("cert cache poisoned");
            if cache.contains(peer_pubkey) {
                return true;
            }
        }

        if ca_key
            .verify(peer_pubkey, &Signature::from_bytes(certificate))
            .is_err()
        {
            return false;
        }

        self.verified_peers
            .lock()
            .expect("cert cache poisoned")
            .insert(*peer_pubkey);
        true
    }

    pub fn has_ca(&self) -> bool {
        self.ca_key.is_some()
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate.is_some()
    }

    pub fn certificate(&self) -> Option<&[u8; CERT_SIZE]> {
        self.certificate.as_ref()
    }

    /// Reload the CRL when its modification time has advanced.
    ///
    /// Returns whether a reload happened. A missing file is not an error.
    pub fn reload_crl_if_changed(&self) -> Result<bool, AuthError> {
        let Some(path) = &self.crl_path else {
            return Ok(false);
        };

        let mtime = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return Ok(false),
        };

        {
            let last = self.crl_mtime.lock().expect("crl mtime lock poisoned");
            if *last == Some(mtime) {
                return Ok(false);
            }
        }

        let text = fs::read_to_string(path).map_err(|source| AuthError::CrlIo {
            path: path.clone(),
            source,
        })?;
        let entries = parse_crl(&text);
        info!("loaded {} revoked keys from {}", entries.len(), path.display());

        *self.revoked.write().expect("revocation lock poisoned") = entries;
        *self.crl_mtime.lock().expect("crl mtime lock poisoned") = Some(mtime);
        Ok(true)
    }
}

fn decode_ca_key(hex_key: &str) -> Result<VerifyingKey, AuthError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| AuthError::InvalidCaKey(format!("not hex: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|v: Vec<u8>| AuthError::InvalidCaKey(format!("{} bytes, expected 32", v.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| AuthError::InvalidCaKey(e.to_string()))
}

/// Load the relay's own certificate: a 64-byte CA signature rendered as hex
/// text. Absent means no certificate; malformed is an operator error that
/// does not stop client service.
fn load_certificate(path: &Path) -> Option<[u8; CERT_SIZE]> {
    let text = fs::read_to_string(path).ok()?;
    match hex::decode(text.trim()) {
        Ok(bytes) => match <[u8; CERT_SIZE]>::try_from(bytes.as_slice()) {
            Ok(cert) => Some(cert),
            Err(_) => {
                warn!(
                    "certificate {} has {} bytes, expected {}; ignoring it",
                    path.display(),
                    bytes.len(),
                    CERT_SIZE
                );
                None
            }
        },
        Err(e) => {
            warn!("certificate {} is not hex ({e}); ignoring it", path.display());
            None
        }
    }
}

/// Parse a CRL: one hex public key per line, trimmed and lowercased; blank
/// lines and `#` comments are skipped.
fn parse_crl(text: &str) -> HashSet<String> {
    text.lines()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}
