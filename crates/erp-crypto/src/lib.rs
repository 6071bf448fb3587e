//! erp-crypto: software primitives of the eRp trust core
//!
//! The VAU transport is an ECIES construction:
//!
//! ```text
//! client ephemeral key pair ──┐
//!                             ├─ ECDH (P-256) ─ HKDF-SHA256(info="ecies-vau-transport") ─ AES-128 key
//! server ECIES key pair ──────┘                                                            │
//!                                                 AES-128-GCM (iv: 12 bytes, tag: 16 bytes) ┘
//! ```
//!
//! The server half of the ECDH runs inside the HSM; this crate supplies the
//! arithmetic for the mock HSM and for clients.

pub mod aes;
pub mod ecdh;
pub mod error;
pub mod kdf;
pub mod keys;

pub use aes::{decrypt, encrypt, random_iv, Sealed};
pub use ecdh::{DiffieHellman, EcKeyPair, PublicKey};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{hkdf_sha256, hmac_sha256};
pub use keys::{Aes128Key, Aes256Key, SymmetricKey};

/// AES-GCM initialisation vector size
pub const IV_SIZE: usize = 12;

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Width of one affine P-256 coordinate
pub const COORDINATE_SIZE: usize = 32;

/// HKDF info string binding derived keys to the VAU transport
pub const VAU_HKDF_INFO: &[u8] = b"ecies-vau-transport";

/// Fill a fresh buffer with `len` bytes from the thread-local CSPRNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut out = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut out);
    out
}
