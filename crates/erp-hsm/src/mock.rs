//! Software stand-in for the HSM
//!
//! Blobs are AES-256-GCM wrapped under a fixed device key, so blobs written
//! by one mock instance stay usable after a restart. Faults can be injected
//! to exercise reconnect, retry and invalidation paths.

use erp_blob::{BlobCache, BlobEntry};
use erp_core::{Blob, BlobType, ErpError, ErpResult, TeeToken};
use erp_crypto::{
    aes, hkdf_sha256, random_bytes, Aes128Key, Aes256Key, DiffieHellman, EcKeyPair, PublicKey,
    IV_SIZE, TAG_SIZE,
};
use secrecy::{ExposeSecret, SecretBox};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};

use crate::client::{
    DeriveKeyInput, DeriveKeyOutput, HsmClient, NonceOutput, RawSession, MAX_RANDOM_BYTES,
};

const DEVICE_KEY_INFO: &[u8] = b"erp-mock-hsm device key";
const TOKEN_PREFIX: &[u8] = b"tee-token";
const NONCE_SIZE: usize = 32;
const SALT_SIZE: usize = 32;

/// Prefix a [`MockAttestor`](crate::token::MockAttestor) puts in front of the nonce.
pub const MOCK_QUOTE_PREFIX: &[u8] = b"quote:";

/// Types the mock provisions when a store has no valid entry for them.
const PROVISIONED_TYPES: [BlobType; 8] = [
    BlobType::EciesKeypair,
    BlobType::TaskKeyDerivation,
    BlobType::CommunicationKeyDerivation,
    BlobType::AuditLogKeyDerivation,
    BlobType::ChargeItemKeyDerivation,
    BlobType::KvnrHashKey,
    BlobType::TelematikIdHashKey,
    BlobType::PseudonameKey,
];

pub struct MockHsmClient {
    device_key: SecretBox<[u8; 32]>,
    token_generation: AtomicU64,
    next_session: AtomicU64,
    fail_connects: AtomicU32,
    fail_operations: AtomicU32,
    reject_operations: AtomicU32,
    connects: AtomicU64,
    random_calls: AtomicU64,
}

impl Default for MockHsmClient {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockHsmClient {
    pub fn new() -> Self {
        let key = hkdf_sha256::<32>(b"erp mock hsm", None, DEVICE_KEY_INFO)
            .map(|k| *k.as_bytes())
            .unwrap_or([0x5a; 32]);
        Self {
            device_key: SecretBox::new(Box::new(key)),
            token_generation: AtomicU64::new(0),
            next_session: AtomicU64::new(1),
            fail_connects: AtomicU32::new(0),
            fail_operations: AtomicU32::new(0),
            reject_operations: AtomicU32::new(0),
            connects: AtomicU64::new(0),
            random_calls: AtomicU64::new(0),
        }
    }

    /// The next `n` connect/reconnect calls fail as unavailable.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` operations fail as unavailable.
    pub fn fail_next_operations(&self, n: u32) {
        self.fail_operations.store(n, Ordering::SeqCst);
    }

    /// The next `n` operations are rejected by the device.
    pub fn reject_next_operations(&self, n: u32) {
        self.reject_operations.store(n, Ordering::SeqCst);
    }

    /// Make every token issued so far unusable.
    pub fn expire_tee_tokens(&self) {
        self.token_generation.fetch_add(2, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn random_call_count(&self) -> u64 {
        self.random_calls.load(Ordering::SeqCst)
    }

    /// Wrap a payload the way enrolment would, without a TEE token.
    pub fn wrap_for_enrolment(&self, payload: &[u8], generation: u64) -> ErpResult<Blob> {
        let iv = aes::random_iv();
        let sealed = aes::encrypt(self.device_key.expose_secret(), &iv, payload)?;
        let mut data = Vec::with_capacity(IV_SIZE + sealed.ciphertext.len() + TAG_SIZE);
        data.extend_from_slice(&iv);
        data.extend_from_slice(&sealed.ciphertext);
        data.extend_from_slice(&sealed.tag);
        Ok(Blob::new(data, generation))
    }

    /// Store a freshly generated blob for every type the service needs and
    /// the cache has no valid entry for.
    pub fn provision_blobs(&self, cache: &BlobCache) -> ErpResult<()> {
        let present = cache.has_valid_blobs_of_type(&PROVISIONED_TYPES);
        for (blob_type, present) in PROVISIONED_TYPES.into_iter().zip(present) {
            if present {
                continue;
            }
            let payload = match blob_type {
                BlobType::EciesKeypair => EcKeyPair::generate().secret_bytes().as_bytes().to_vec(),
                _ => Aes256Key::generate().as_bytes().to_vec(),
            };
            let blob = self.wrap_for_enrolment(&payload, 1)?;
            let name = format!("mock-{}", blob_type.as_u8());
            let id = cache.store_blob(BlobEntry::new(blob_type, name, blob))?;
            info!(blob_type = %blob_type, id = %id, "mock HSM provisioned blob");
        }
        Ok(())
    }

    fn unwrap(&self, blob: &Blob) -> ErpResult<Vec<u8>> {
        if blob.data.len() < IV_SIZE + TAG_SIZE {
            return Err(ErpError::Hsm("blob too short".into()));
        }
        let (iv, rest) = blob.data.split_at(IV_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
        aes::decrypt(self.device_key.expose_secret(), iv, ciphertext, tag)
            .map_err(|_| ErpError::Hsm("blob was not wrapped by this device".into()))
    }

    fn check_faults(&self) -> ErpResult<()> {
        if take_one(&self.fail_operations) {
            return Err(ErpError::HsmUnavailable("injected connection loss".into()));
        }
        if take_one(&self.reject_operations) {
            return Err(ErpError::Hsm("injected device error".into()));
        }
        Ok(())
    }

    /// Tokens of the current and the previous generation are accepted.
    fn verify_tee_token(&self, token: &TeeToken) -> ErpResult<()> {
        let payload = self
            .unwrap(token.as_blob())
            .map_err(|_| ErpError::Hsm("invalid TEE token".into()))?;
        let generation = payload
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|g| <[u8; 8]>::try_from(g).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| ErpError::Hsm("invalid TEE token".into()))?;
        let current = self.token_generation.load(Ordering::SeqCst);
        if generation == 0 || generation > current || current - generation > 1 {
            return Err(ErpError::Hsm("TEE token expired".into()));
        }
        Ok(())
    }

    fn operation(&self, token: &TeeToken) -> ErpResult<()> {
        self.check_faults()?;
        self.verify_tee_token(token)
    }

    fn ecies_keypair(&self, blob: &Blob) -> ErpResult<EcKeyPair> {
        let scalar = self.unwrap(blob)?;
        EcKeyPair::from_secret_bytes(&scalar)
            .map_err(|e| ErpError::Hsm(format!("ECIES blob: {e}")))
    }
}

impl HsmClient for MockHsmClient {
    fn connect(&self) -> ErpResult<RawSession> {
        if take_one(&self.fail_connects) {
            return Err(ErpError::HsmUnavailable("injected connect failure".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        debug!(session = id, "mock HSM session opened");
        Ok(RawSession { id, reconnects: 0 })
    }

    fn reconnect(&self, raw: &mut RawSession) -> ErpResult<()> {
        if take_one(&self.fail_connects) {
            return Err(ErpError::HsmUnavailable("injected reconnect failure".into()));
        }
        raw.reconnects += 1;
        Ok(())
    }

    fn get_nonce(&self, _raw: &RawSession) -> ErpResult<NonceOutput> {
        self.check_faults()?;
        let nonce = random_bytes(NONCE_SIZE);
        let blob = self.wrap_for_enrolment(&nonce, 0)?;
        Ok(NonceOutput { nonce, blob })
    }

    fn get_tee_token(
        &self,
        _raw: &RawSession,
        nonce_blob: &Blob,
        attestation: &[u8],
    ) -> ErpResult<TeeToken> {
        self.check_faults()?;
        let nonce = self.unwrap(nonce_blob)?;
        if attestation.strip_prefix(MOCK_QUOTE_PREFIX) != Some(nonce.as_slice()) {
            return Err(ErpError::Hsm("attestation does not cover the nonce".into()));
        }
        let generation = self.token_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut payload = TOKEN_PREFIX.to_vec();
        payload.extend_from_slice(&generation.to_be_bytes());
        Ok(TeeToken(self.wrap_for_enrolment(&payload, generation)?))
    }

    fn wrap_raw_payload(
        &self,
        _raw: &RawSession,
        tee_token: &TeeToken,
        payload: &[u8],
        generation: u64,
    ) -> ErpResult<Blob> {
        self.operation(tee_token)?;
        self.wrap_for_enrolment(payload, generation)
    }

    fn unwrap_raw_payload(
        &self,
        _raw: &RawSession,
        tee_token: &TeeToken,
        blob: &Blob,
    ) -> ErpResult<Vec<u8>> {
        self.operation(tee_token)?;
        self.unwrap(blob)
    }

    fn derive_key(
        &self,
        _raw: &RawSession,
        input: DeriveKeyInput<'_>,
    ) -> ErpResult<DeriveKeyOutput> {
        self.operation(input.tee_token)?;
        let root = self.unwrap(input.derivation_key)?;

        let mut data = input.derivation_data;
        let salt = if input.initial {
            let salt = random_bytes(SALT_SIZE);
            data.extend_from_slice(&salt);
            Some(salt)
        } else {
            None
        };
        data.push(input.blob_type.as_u8());

        let key = hkdf_sha256::<32>(&root, None, &data)?;
        Ok(DeriveKeyOutput { key, salt })
    }

    fn vau_ecies128(
        &self,
        _raw: &RawSession,
        tee_token: &TeeToken,
        ecies_keypair: &Blob,
        client_public_key: &PublicKey,
    ) -> ErpResult<Aes128Key> {
        self.operation(tee_token)?;
        let mut dh = DiffieHellman::new();
        dh.set_private_public_key(self.ecies_keypair(ecies_keypair)?);
        dh.set_peer_public_key(*client_public_key);
        Ok(dh.create_transport_key()?)
    }

    fn get_ecies_public_key(
        &self,
        _raw: &RawSession,
        tee_token: &TeeToken,
        ecies_keypair: &Blob,
    ) -> ErpResult<PublicKey> {
        self.operation(tee_token)?;
        Ok(*self.ecies_keypair(ecies_keypair)?.public_key())
    }

    fn unwrap_hash_key(
        &self,
        _raw: &RawSession,
        tee_token: &TeeToken,
        hash_key: &Blob,
    ) -> ErpResult<Aes256Key> {
        self.operation(tee_token)?;
        let raw_key = self.unwrap(hash_key)?;
        Aes256Key::from_slice(&raw_key).map_err(|e| ErpError::Hsm(format!("hash key blob: {e}")))
    }

    fn random_bytes(&self, _raw: &RawSession, count: usize) -> ErpResult<Vec<u8>> {
        self.check_faults()?;
        if count > MAX_RANDOM_BYTES {
            return Err(ErpError::Hsm(format!(
                "at most {MAX_RANDOM_BYTES} random bytes per request, asked for {count}"
            )));
        }
        self.random_calls.fetch_add(1, Ordering::SeqCst);
        Ok(random_bytes(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erp_blob::MemoryBlobStore;

    fn token(client: &MockHsmClient, raw: &RawSession) -> TeeToken {
        let nonce = client.get_nonce(raw).unwrap();
        let quote = [MOCK_QUOTE_PREFIX, nonce.nonce.as_slice()].concat();
        client.get_tee_token(raw, &nonce.blob, &quote).unwrap()
    }

    #[test]
    fn test_wrap_unwrap() {
        let client = MockHsmClient::new();
        let raw = client.connect().unwrap();
        let token = token(&client, &raw);
        let blob = client.wrap_raw_payload(&raw, &token, b"payload", 4).unwrap();
        assert_eq!(blob.generation, 4);
        assert_ne!(blob.data, b"payload");
        assert_eq!(
            client.unwrap_raw_payload(&raw, &token, &blob).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_blobs_survive_a_restart() {
        let blob = MockHsmClient::new().wrap_for_enrolment(b"k", 1).unwrap();
        let other = MockHsmClient::new();
        assert_eq!(other.unwrap(&blob).unwrap(), b"k");
    }

    #[test]
    fn test_attestation_must_cover_nonce() {
        let client = MockHsmClient::new();
        let raw = client.connect().unwrap();
        let nonce = client.get_nonce(&raw).unwrap();
        let err = client
            .get_tee_token(&raw, &nonce.blob, b"quote:something else")
            .unwrap_err();
        assert!(matches!(err, ErpError::Hsm(_)));
    }

    #[test]
    fn test_previous_token_is_still_accepted() {
        let client = MockHsmClient::new();
        let raw = client.connect().unwrap();
        let first = token(&client, &raw);
        let _second = token(&client, &raw);
        assert!(client.wrap_raw_payload(&raw, &first, b"x", 1).is_ok());

        let _third = token(&client, &raw);
        assert!(matches!(
            client.wrap_raw_payload(&raw, &first, b"x", 1),
            Err(ErpError::Hsm(_))
        ));
    }

    #[test]
    fn test_expired_tokens_rejected() {
        let client = MockHsmClient::new();
        let raw = client.connect().unwrap();
        let token = token(&client, &raw);
        client.expire_tee_tokens();
        assert!(client.wrap_raw_payload(&raw, &token, b"x", 1).is_err());
    }

    #[test]
    fn test_derivation_is_deterministic_with_salt() {
        let client = MockHsmClient::new();
        let raw = client.connect().unwrap();
        let token = token(&client, &raw);
        let root = client.wrap_for_enrolment(&[7u8; 32], 1).unwrap();

        let first = client
            .derive_key(
                &raw,
                DeriveKeyInput {
                    blob_type: BlobType::TaskKeyDerivation,
                    tee_token: &token,
                    derivation_key: &root,
                    initial: true,
                    derivation_data: b"task-1".to_vec(),
                },
            )
            .unwrap();
        let salt = first.salt.clone().unwrap();

        let mut data = b"task-1".to_vec();
        data.extend_from_slice(&salt);
        let again = client
            .derive_key(
                &raw,
                DeriveKeyInput {
                    blob_type: BlobType::TaskKeyDerivation,
                    tee_token: &token,
                    derivation_key: &root,
                    initial: false,
                    derivation_data: data,
                },
            )
            .unwrap();
        assert!(again.salt.is_none());
        assert_eq!(first.key, again.key);
    }

    #[test]
    fn test_random_limit() {
        let client = MockHsmClient::new();
        let raw = client.connect().unwrap();
        assert_eq!(client.random_bytes(&raw, MAX_RANDOM_BYTES).unwrap().len(), 320);
        assert!(client.random_bytes(&raw, MAX_RANDOM_BYTES + 1).is_err());
    }

    #[test]
    fn test_fault_injection() {
        let client = MockHsmClient::new();
        client.fail_next_connects(1);
        assert!(matches!(
            client.connect(),
            Err(ErpError::HsmUnavailable(_))
        ));
        let raw = client.connect().unwrap();

        client.fail_next_operations(1);
        assert!(client.random_bytes(&raw, 1).unwrap_err().is_transient());
        client.reject_next_operations(1);
        assert!(matches!(client.random_bytes(&raw, 1), Err(ErpError::Hsm(_))));
        assert!(client.random_bytes(&raw, 1).is_ok());
    }

    #[test]
    fn test_provision_fills_missing_types_once() {
        let cache = BlobCache::new(Box::new(MemoryBlobStore::new()), "test").unwrap();
        let client = MockHsmClient::new();
        client.provision_blobs(&cache).unwrap();
        assert!(cache
            .has_valid_blobs_of_type(&PROVISIONED_TYPES)
            .into_iter()
            .all(|v| v));

        client.provision_blobs(&cache).unwrap();
        assert_eq!(
            cache.get_all_blobs_sorted_by_id().unwrap().len(),
            PROVISIONED_TYPES.len()
        );
    }
}
