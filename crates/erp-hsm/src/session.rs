//! One exclusive connection to the HSM

use erp_blob::BlobCache;
use erp_core::{Blob, BlobId, BlobType, ErpError, ErpResult, TeeToken};
use erp_crypto::{Aes128Key, Aes256Key, DiffieHellman, EcKeyPair, PublicKey};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::client::{DeriveKeyInput, HsmClient, NonceOutput, RawSession, MAX_RANDOM_BYTES};

/// A per-record key together with what the record must persist to derive
/// it again.
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub key: Aes256Key,
    pub salt: Vec<u8>,
    pub blob_id: BlobId,
}

/// Exclusively owned HSM connection.
///
/// Every device call goes through a guard: a call that fails as unavailable
/// is retried once after a reconnect. A session whose call failed with an
/// HSM-side error is marked invalid and must not be reused.
pub struct HsmSession {
    client: Arc<dyn HsmClient>,
    blob_cache: Arc<BlobCache>,
    raw: RawSession,
    tee_token: Option<TeeToken>,
    last_call: Instant,
    valid: bool,
}

impl HsmSession {
    pub fn new(client: Arc<dyn HsmClient>, blob_cache: Arc<BlobCache>, raw: RawSession) -> Self {
        Self {
            client,
            blob_cache,
            raw,
            tee_token: None,
            last_call: Instant::now(),
            valid: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.raw.id
    }

    pub fn set_tee_token(&mut self, token: Option<TeeToken>) {
        self.tee_token = token;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        if self.valid {
            debug!(session = self.raw.id, "HSM session invalidated");
        }
        self.valid = false;
    }

    pub fn idle_for(&self) -> Duration {
        self.last_call.elapsed()
    }

    pub fn blob_cache(&self) -> &Arc<BlobCache> {
        &self.blob_cache
    }

    fn tee_token(&self) -> ErpResult<TeeToken> {
        self.tee_token
            .clone()
            .ok_or_else(|| ErpError::Hsm("session has no TEE token".into()))
    }

    fn guarded<T>(
        &mut self,
        operation: &'static str,
        call: impl Fn(&dyn HsmClient, &RawSession) -> ErpResult<T>,
    ) -> ErpResult<T> {
        if !self.valid {
            return Err(ErpError::HsmUnavailable(format!(
                "{operation}: session is no longer valid"
            )));
        }
        let client = Arc::clone(&self.client);
        let mut result = call(client.as_ref(), &self.raw);

        if let Err(e) = &result {
            if e.is_transient() {
                warn!(
                    session = self.raw.id,
                    operation,
                    "HSM call failed ({e}), reconnecting for one retry"
                );
                result = client
                    .reconnect(&mut self.raw)
                    .and_then(|()| call(client.as_ref(), &self.raw));
            }
        }
        self.last_call = Instant::now();

        if let Err(e) = &result {
            if e.invalidates_session() {
                self.invalidate();
            }
        }
        result
    }

    /// Up to [`MAX_RANDOM_BYTES`] bytes from the device RNG.
    pub fn random(&mut self, count: usize) -> ErpResult<Vec<u8>> {
        if count > MAX_RANDOM_BYTES {
            return Err(ErpError::MalformedInput(format!(
                "at most {MAX_RANDOM_BYTES} random bytes per call, asked for {count}"
            )));
        }
        self.guarded("random", |c, raw| c.random_bytes(raw, count))
    }

    pub fn get_nonce(&mut self) -> ErpResult<NonceOutput> {
        self.guarded("get_nonce", |c, raw| c.get_nonce(raw))
    }

    pub fn get_tee_token(&mut self, nonce_blob: &Blob, attestation: &[u8]) -> ErpResult<TeeToken> {
        self.guarded("get_tee_token", |c, raw| {
            c.get_tee_token(raw, nonce_blob, attestation)
        })
    }

    pub fn wrap_raw_payload(&mut self, payload: &[u8], generation: u64) -> ErpResult<Blob> {
        let token = self.tee_token()?;
        self.guarded("wrap_raw_payload", |c, raw| {
            c.wrap_raw_payload(raw, &token, payload, generation)
        })
    }

    pub fn unwrap_raw_payload(&mut self, blob: &Blob) -> ErpResult<Vec<u8>> {
        let token = self.tee_token()?;
        self.guarded("unwrap_raw_payload", |c, raw| {
            c.unwrap_raw_payload(raw, &token, blob)
        })
    }

    /// Derive a persistence key from a derivation blob.
    ///
    /// Without `existing` the current blob of `blob_type` is used and the
    /// device picks a fresh salt. With `existing` the referenced blob is
    /// looked up by id (expired blobs included) and the stored salt is
    /// replayed. Communication keys may also be read with a task derivation
    /// blob, which older records reference.
    pub fn derive_key(
        &mut self,
        blob_type: BlobType,
        derivation_data: &[u8],
        existing: Option<(BlobId, &[u8])>,
    ) -> ErpResult<DerivedKey> {
        let token = self.tee_token()?;
        let entry = match existing {
            None => self.blob_cache.get_blob(blob_type)?,
            Some((blob_id, _)) => {
                let entry = self.blob_cache.get_blob_by_id_any_type(blob_id)?;
                let legacy = blob_type == BlobType::CommunicationKeyDerivation
                    && entry.blob_type == BlobType::TaskKeyDerivation;
                if entry.blob_type != blob_type && !legacy {
                    return Err(ErpError::NotFound(format!(
                        "blob {blob_id} is a {} blob, expected {blob_type}",
                        entry.blob_type
                    )));
                }
                entry
            }
        };

        let mut data = derivation_data.to_vec();
        if let Some((_, salt)) = existing {
            data.extend_from_slice(salt);
        }
        let output = self.guarded("derive_key", |c, raw| {
            c.derive_key(
                raw,
                DeriveKeyInput {
                    blob_type: entry.blob_type,
                    tee_token: &token,
                    derivation_key: &entry.blob,
                    initial: existing.is_none(),
                    derivation_data: data.clone(),
                },
            )
        })?;

        let salt = match (output.salt, existing) {
            (Some(salt), _) => salt,
            (None, Some((_, salt))) => salt.to_vec(),
            (None, None) => {
                return Err(ErpError::Hsm("initial derivation returned no salt".into()))
            }
        };
        Ok(DerivedKey {
            key: output.key,
            salt,
            blob_id: entry.id,
        })
    }

    pub fn vau_ecies128(
        &mut self,
        ecies_keypair: &Blob,
        client_public_key: &PublicKey,
    ) -> ErpResult<Aes128Key> {
        let token = self.tee_token()?;
        self.guarded("vau_ecies128", |c, raw| {
            c.vau_ecies128(raw, &token, ecies_keypair, client_public_key)
        })
    }

    /// Public half of the current ECIES key pair.
    pub fn get_ecies_public_key(&mut self) -> ErpResult<PublicKey> {
        let token = self.tee_token()?;
        let entry = self.blob_cache.get_blob(BlobType::EciesKeypair).map_err(|_| {
            ErpError::Configuration("no valid ECIES key pair is provisioned".into())
        })?;
        self.guarded("get_ecies_public_key", |c, raw| {
            c.get_ecies_public_key(raw, &token, &entry.blob)
        })
    }

    pub fn unwrap_hash_key(&mut self, hash_key: &Blob) -> ErpResult<Aes256Key> {
        let token = self.tee_token()?;
        self.guarded("unwrap_hash_key", |c, raw| {
            c.unwrap_hash_key(raw, &token, hash_key)
        })
    }

    /// Software ECDH with a fresh ephemeral key pair, for handshakes that do
    /// not involve a device-held key.
    pub fn create_diffie_hellman(&self) -> DiffieHellman {
        let mut dh = DiffieHellman::new();
        dh.set_private_public_key(EcKeyPair::generate());
        dh
    }

    /// Issue a cheap device call if the session has been idle for at least
    /// `threshold`, so the device does not drop it.
    pub fn keep_alive(&mut self, threshold: Duration) {
        if !self.valid || self.idle_for() < threshold {
            return;
        }
        match self.random(1) {
            Ok(_) => debug!(session = self.raw.id, "HSM session kept alive"),
            Err(e) => warn!(session = self.raw.id, "HSM keep-alive failed: {e}"),
        }
    }
}

impl std::fmt::Debug for HsmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmSession")
            .field("id", &self.raw.id)
            .field("valid", &self.valid)
            .field("has_tee_token", &self.tee_token.is_some())
            .finish()
    }
}
