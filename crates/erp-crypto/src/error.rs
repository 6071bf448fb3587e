use erp_core::ErpError;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// AES-GCM tag did not verify.
    #[error("authentication tag mismatch")]
    Authentication,

    #[error("{what} must be {expected} bytes, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("point is not on the curve")]
    InvalidPoint,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),
}

impl From<CryptoError> for ErpError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Authentication => ErpError::AuthenticationFailed(e.to_string()),
            CryptoError::InvalidLength { .. } | CryptoError::InvalidPoint => {
                ErpError::MalformedInput(e.to_string())
            }
            CryptoError::InvalidKey(_) | CryptoError::Kdf(_) => {
                ErpError::CryptographicKey(e.to_string())
            }
        }
    }
}

pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> CryptoResult<()> {
    if expected != actual {
        return Err(CryptoError::InvalidLength {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
