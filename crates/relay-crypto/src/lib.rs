//! Identity and trust plane for the relay.
//!
//! - [`identity`]: the persistent Ed25519 keypair that names this relay on
//!   the mesh.
//! - [`auth`]: signing and verification of mesh packets, CA certificate
//!   checks, and the hot-reloadable revocation list.
//! - [`tls`]: the TLS server credential for client sessions.

#![forbid(unsafe_code)]

pub mod auth;
pub mod identity;
pub mod tls;

pub use auth::{AuthError, RelayAuth};
pub use identity::RelayIdentity;
