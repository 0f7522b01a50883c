//! TLS server credential for client sessions.
//!
//! Loads `cert_dir/relay.crt` + `relay.key` when both exist, otherwise
//! issues a self-signed P-256 certificate and persists it. Client trust
//! comes from the PoW handshake and application-layer signatures, so the
//! listener never requests client certificates.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tracing::info;

pub const TLS_CERT_FILE: &str = "relay.crt";
pub const TLS_KEY_FILE: &str = "relay.key";

const CERT_COMMON_NAME: &str = "bitchat-relay";
const CERT_VALIDITY_DAYS: i64 = 3650;

/// Build the TLS 1.3-only server configuration, generating a self-signed
/// credential on first run.
pub fn server_config(cert_dir: &Path) -> Result<Arc<ServerConfig>> {
    let cert_path = cert_dir.join(TLS_CERT_FILE);
    let key_path = cert_dir.join(TLS_KEY_FILE);

    if !cert_path.exists() || !key_path.exists() {
        generate_self_signed(&cert_path, &key_path)?;
    }

    let certs = load_certs(&cert_path)?;
    let key = load_key(&key_path)?;

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS credential rejected by rustls")?;

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open TLS certificate {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("failed to parse TLS certificate {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open TLS key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse TLS key {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

/// Issue a self-signed ECDSA P-256 server certificate with 10-year
/// validity and persist it with owner-only permissions on the key.
fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose};

    if let Some(dir) = cert_path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cert directory {}", dir.display()))?;
    }

    let mut params = CertificateParams::new(vec![CERT_COMMON_NAME.to_string()])
        .context("invalid certificate parameters")?;
    params
        .distinguished_name
        .push(DnType::CommonName, CERT_COMMON_NAME);
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let key_pair = KeyPair::generate().context("failed to generate TLS key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign TLS certificate")?;

    fs::write(cert_path, cert.pem())
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    fs::write(key_path, key_pair.serialize_pem())
        .with_context(|| format!("failed to write {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(key_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(key_path, perms)?;
    }

    info!(
        "generated self-signed TLS certificate at {}",
        cert_path.display()
    );
    Ok(())
}
