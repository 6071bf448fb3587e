//! HKDF-SHA256 and HMAC-SHA256

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;

/// HKDF-SHA256 extract-and-expand into an `N`-byte key.
pub fn hkdf_sha256<const N: usize>(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> CryptoResult<SymmetricKey<N>> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    let key = SymmetricKey::from_bytes(okm);
    zeroize::Zeroize::zeroize(&mut okm);
    Ok(key)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> CryptoResult<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("HMAC key: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}
