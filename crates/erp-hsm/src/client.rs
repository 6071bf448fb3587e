//! Capability interface of an HSM device
//!
//! The pool, sessions and key derivation depend only on [`HsmClient`]; the
//! backend (mock or vendor client) is chosen once at startup.

use erp_core::{Blob, BlobType, ErpResult, TeeToken};
use erp_crypto::{Aes128Key, Aes256Key, PublicKey};

/// Largest random request a single HSM call may serve.
pub const MAX_RANDOM_BYTES: usize = 320;

/// Device-side handle of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSession {
    pub id: u64,
    pub reconnects: u32,
}

/// Attestation challenge: the nonce in clear plus its wrapped form, which the
/// HSM checks when it issues a TEE token.
#[derive(Debug, Clone)]
pub struct NonceOutput {
    pub nonce: Vec<u8>,
    pub blob: Blob,
}

pub struct DeriveKeyInput<'a> {
    pub blob_type: BlobType,
    pub tee_token: &'a TeeToken,
    pub derivation_key: &'a Blob,
    /// Insert path: the HSM appends a fresh salt to `derivation_data`.
    pub initial: bool,
    /// Record-specific data; on the read path it already ends with the salt.
    pub derivation_data: Vec<u8>,
}

pub struct DeriveKeyOutput {
    pub key: Aes256Key,
    /// Salt chosen by the HSM, present only for initial derivations.
    pub salt: Option<Vec<u8>>,
}

pub trait HsmClient: Send + Sync {
    fn connect(&self) -> ErpResult<RawSession>;

    fn reconnect(&self, raw: &mut RawSession) -> ErpResult<()>;

    fn get_nonce(&self, raw: &RawSession) -> ErpResult<NonceOutput>;

    fn get_tee_token(
        &self,
        raw: &RawSession,
        nonce_blob: &Blob,
        attestation: &[u8],
    ) -> ErpResult<TeeToken>;

    fn wrap_raw_payload(
        &self,
        raw: &RawSession,
        tee_token: &TeeToken,
        payload: &[u8],
        generation: u64,
    ) -> ErpResult<Blob>;

    fn unwrap_raw_payload(
        &self,
        raw: &RawSession,
        tee_token: &TeeToken,
        blob: &Blob,
    ) -> ErpResult<Vec<u8>>;

    fn derive_key(&self, raw: &RawSession, input: DeriveKeyInput<'_>)
        -> ErpResult<DeriveKeyOutput>;

    /// ECDH of the wrapped ECIES key with the client key, stretched into the
    /// AES-128 transport key. The private key never leaves the device.
    fn vau_ecies128(
        &self,
        raw: &RawSession,
        tee_token: &TeeToken,
        ecies_keypair: &Blob,
        client_public_key: &PublicKey,
    ) -> ErpResult<Aes128Key>;

    fn get_ecies_public_key(
        &self,
        raw: &RawSession,
        tee_token: &TeeToken,
        ecies_keypair: &Blob,
    ) -> ErpResult<PublicKey>;

    fn unwrap_hash_key(
        &self,
        raw: &RawSession,
        tee_token: &TeeToken,
        hash_key: &Blob,
    ) -> ErpResult<Aes256Key>;

    /// At most [`MAX_RANDOM_BYTES`] per call.
    fn random_bytes(&self, raw: &RawSession, count: usize) -> ErpResult<Vec<u8>>;
}
