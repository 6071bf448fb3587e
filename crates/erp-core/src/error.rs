use thiserror::Error;

pub type ErpResult<T> = Result<T, ErpError>;

#[derive(Debug, Error)]
pub enum ErpError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Connection or session failure; the HSM may come back.
    #[error("HSM unavailable: {0}")]
    HsmUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The HSM answered, but rejected the operation.
    #[error("HSM error: {0}")]
    Hsm(String),

    #[error("cryptographic key error: {0}")]
    CryptographicKey(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ErpError {
    /// Errors worth a reconnect-and-retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErpError::HsmUnavailable(_))
    }

    /// Errors after which an HSM session must not be reused.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, ErpError::HsmUnavailable(_) | ErpError::Hsm(_))
    }

    /// Short machine-readable code, used in administrative error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ErpError::NotFound(_) => "not_found",
            ErpError::Conflict(_) => "conflict",
            ErpError::AuthenticationFailed(_) => "authentication_failed",
            ErpError::MalformedInput(_) => "malformed_input",
            ErpError::HsmUnavailable(_) => "hsm_unavailable",
            ErpError::Configuration(_) => "configuration_error",
            ErpError::Hsm(_) => "hsm_error",
            ErpError::CryptographicKey(_) => "cryptographic_key_error",
            ErpError::Storage(_) => "storage_error",
            ErpError::Io(_) => "io_error",
            ErpError::Other(_) => "internal_error",
        }
    }
}
