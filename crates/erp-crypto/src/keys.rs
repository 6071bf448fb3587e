//! Fixed-size symmetric keys, zeroized on drop

use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{check_len, CryptoResult};

/// A symmetric key of `N` bytes. Never printed, wiped on drop.
#[derive(Clone)]
pub struct SymmetricKey<const N: usize> {
    bytes: [u8; N],
}

pub type Aes128Key = SymmetricKey<16>;
pub type Aes256Key = SymmetricKey<32>;

impl<const N: usize> SymmetricKey<N> {
    pub const SIZE: usize = N;

    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        check_len("key", N, bytes.len())?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(Self { bytes: out })
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; N];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> PartialEq for SymmetricKey<N> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl<const N: usize> Eq for SymmetricKey<N> {}

impl<const N: usize> Drop for SymmetricKey<N> {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl<const N: usize> std::fmt::Debug for SymmetricKey<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("len", &N)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_checks_length() {
        assert!(Aes128Key::from_slice(&[0u8; 16]).is_ok());
        assert!(Aes128Key::from_slice(&[0u8; 32]).is_err());
        assert!(Aes256Key::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(Aes256Key::generate(), Aes256Key::generate());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = Aes128Key::from_bytes([0x41; 16]);
        let shown = format!("{key:?}");
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains("65"));
    }
}
