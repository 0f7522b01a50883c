//! Persistent Ed25519 relay identity.
//!
//! The keypair is stored at `key_dir/relay_ed25519.key` as the raw 64-byte
//! seed+public concatenation. It is generated once on first run and
//! reloaded verbatim thereafter; the public key is the relay's stable
//! identity on the mesh.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroize;

/// File name of the private key inside the key directory.
pub const KEY_FILE: &str = "relay_ed25519.key";

/// Stored keypair length: 32-byte seed followed by the 32-byte public key.
pub const KEYPAIR_SIZE: usize = 64;

#[derive(Debug)]
pub struct RelayIdentity {
    signing_key: SigningKey,
}

impl RelayIdentity {
    /// Load the keypair from `key_dir`, generating and persisting a new one
    /// when no key file exists.
    ///
    /// A key file of the wrong size is an error the operator must resolve;
    /// it is never silently regenerated.
    pub fn load_or_generate(key_dir: &Path) -> Result<Self> {
        let path = key_dir.join(KEY_FILE);
        if path.exists() {
            return Self::load(&path);
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let identity = Self { signing_key };
        identity.save(&path)?;
        Ok(identity)
    }

    fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read relay key {}", path.display()))?;

        if bytes.len() != KEYPAIR_SIZE {
            anyhow::bail!(
                "relay key {} has {} bytes, expected {}; refusing to regenerate over it",
                path.display(),
                bytes.len(),
                KEYPAIR_SIZE
            );
        }

        let mut key_bytes = [0u8; KEYPAIR_SIZE];
        key_bytes.copy_from_slice(&bytes);
        let signing_key = SigningKey::from_keypair_bytes(&key_bytes)
            .map_err(|e| anyhow::anyhow!("relay key {} is malformed: {e}", path.display()))?;
        key_bytes.zeroize();

        Ok(Self { signing_key })
    }

    /// Write the keypair with owner-only permissions.
    ///
    /// This happens before any other relay state file is created.
    fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create key directory {}", dir.display()))?;
        }

        let keypair_bytes = self.signing_key.to_keypair_bytes();
        fs::write(path, keypair_bytes)
            .with_context(|| format!("failed to write relay key {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Sign a mesh payload.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// Hex rendering of the public key, as used in CRLs and logs.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    #[cfg(any(test, feature = "test-keys"))]
    pub fn ephemeral() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }
}
