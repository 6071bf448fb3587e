//! AES-GCM with a detached authentication tag
//!
//! Accepts 128- and 256-bit keys; the key length selects the cipher.

use aes_gcm::{aead::Aead, Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

use crate::error::{check_len, CryptoError, CryptoResult};
use crate::{IV_SIZE, TAG_SIZE};

/// Ciphertext and tag produced by [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> CryptoResult<Sealed> {
    check_len("iv", IV_SIZE, iv.len())?;
    let nonce = Nonce::from_slice(iv);

    let mut combined = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(nonce, plaintext),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(nonce, plaintext),
        other => {
            return Err(CryptoError::InvalidKey(format!(
                "AES-GCM key must be 16 or 32 bytes, got {other}"
            )))
        }
    }
    .map_err(|_| CryptoError::InvalidKey("AES-GCM encryption failed".into()))?;

    // aes-gcm appends the tag to the ciphertext
    let tag_start = combined.len() - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&combined[tag_start..]);
    combined.truncate(tag_start);

    Ok(Sealed {
        ciphertext: combined,
        tag,
    })
}

/// Decrypt and verify. Any tag mismatch yields [`CryptoError::Authentication`]
/// and no plaintext.
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8], tag: &[u8]) -> CryptoResult<Vec<u8>> {
    check_len("iv", IV_SIZE, iv.len())?;
    check_len("tag", TAG_SIZE, tag.len())?;
    let nonce = Nonce::from_slice(iv);

    let mut ct_with_tag = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    ct_with_tag.extend_from_slice(ciphertext);
    ct_with_tag.extend_from_slice(tag);

    let opened = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(nonce, ct_with_tag.as_ref()),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(nonce, ct_with_tag.as_ref()),
        other => {
            return Err(CryptoError::InvalidKey(format!(
                "AES-GCM key must be 16 or 32 bytes, got {other}"
            )))
        }
    };
    opened.map_err(|_| CryptoError::Authentication)
}
