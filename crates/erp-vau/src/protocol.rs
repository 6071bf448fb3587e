//! Server side of the VAU transport
//!
//! Each request carries a fresh client key, so every decrypt is a full ECIES
//! handshake. The ECDH step runs inside an HSM session against the stored
//! ECIES key pairs, newest first; the first one whose transport key
//! authenticates the ciphertext wins.

use erp_core::{ErpError, ErpResult};
use erp_crypto::{aes, Aes128Key, CryptoError, DiffieHellman, EcKeyPair, PublicKey, IV_SIZE, TAG_SIZE};
use erp_hsm::{HsmPool, PooledSession};
use http::Response;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::inner::{InnerTeeRequest, InnerTeeResponse, REQUEST_ID_SIZE};
use crate::outer::{OuterTeeResponse, VAU_VERSION};

/// `iv || ciphertext || tag` under the response key.
pub(crate) fn seal_symmetric(key: &Aes128Key, plaintext: &[u8]) -> ErpResult<Vec<u8>> {
    let iv = aes::random_iv();
    let sealed = aes::encrypt(key.as_bytes(), &iv, plaintext)?;
    let mut out = Vec::with_capacity(IV_SIZE + sealed.ciphertext.len() + TAG_SIZE);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&sealed.ciphertext);
    out.extend_from_slice(&sealed.tag);
    Ok(out)
}

pub(crate) fn open_symmetric(key: &Aes128Key, wire: &[u8]) -> ErpResult<Vec<u8>> {
    if wire.len() < IV_SIZE + TAG_SIZE {
        return Err(ErpError::MalformedInput(format!(
            "symmetric VAU message of {} bytes",
            wire.len()
        )));
    }
    let (iv, rest) = wire.split_at(IV_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
    Ok(aes::decrypt(key.as_bytes(), iv, ciphertext, tag)?)
}

/// Encrypt under a new ephemeral key against `peer`.
pub(crate) fn seal_asymmetric(peer: &PublicKey, plaintext: &[u8]) -> ErpResult<Vec<u8>> {
    let ephemeral = EcKeyPair::generate();
    let mut outer = OuterTeeResponse {
        version: VAU_VERSION,
        x: [0; 32],
        y: [0; 32],
        iv: aes::random_iv(),
        ciphertext: Vec::new(),
        tag: [0; TAG_SIZE],
    };
    outer.set_public_key(ephemeral.public_key())?;

    let mut dh = DiffieHellman::new();
    dh.set_private_public_key(ephemeral);
    dh.set_peer_public_key(*peer);
    let key = dh.create_transport_key()?;

    let sealed = aes::encrypt(key.as_bytes(), &outer.iv, plaintext)?;
    outer.ciphertext = sealed.ciphertext;
    outer.tag = sealed.tag;
    Ok(outer.assemble())
}

/// What the server needs to answer a decrypted request.
pub struct ResponseContext {
    request_id: [u8; REQUEST_ID_SIZE],
    response_key: Option<Aes128Key>,
    client_public_key: PublicKey,
}

impl ResponseContext {
    pub fn new(
        request_id: [u8; REQUEST_ID_SIZE],
        response_key: Option<Aes128Key>,
        client_public_key: PublicKey,
    ) -> Self {
        Self {
            request_id,
            response_key,
            client_public_key,
        }
    }

    pub fn request_id(&self) -> &[u8; REQUEST_ID_SIZE] {
        &self.request_id
    }

    pub fn has_response_key(&self) -> bool {
        self.response_key.is_some()
    }

    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public_key
    }
}

impl std::fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseContext")
            .field("request_id", &hex::encode(self.request_id))
            .field("symmetric", &self.response_key.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct DecryptedRequest {
    pub inner: InnerTeeRequest,
    pub context: ResponseContext,
}

#[derive(Clone)]
pub struct TeeProtocol {
    pool: Arc<HsmPool>,
}

impl TeeProtocol {
    pub fn new(pool: Arc<HsmPool>) -> Self {
        Self { pool }
    }

    pub fn decrypt(&self, wire: &[u8]) -> ErpResult<DecryptedRequest> {
        let outer = crate::outer::OuterTeeRequest::parse(wire)?;
        let client_public_key = outer.public_key()?;

        let keypairs = self.pool.blob_cache().get_ecies_keypairs()?;
        if keypairs.is_empty() {
            return Err(ErpError::Configuration(
                "no valid ECIES key pair is provisioned".into(),
            ));
        }

        let plaintext = {
            let mut session: Option<PooledSession> = None;
            let mut opened = None;
            for entry in &keypairs {
                // an invalidated session goes back before its replacement is acquired
                if session.as_ref().is_some_and(|s| !s.is_valid()) {
                    session = None;
                }
                let current = match &mut session {
                    Some(current) => current,
                    slot @ None => slot.insert(self.pool.acquire()?),
                };
                let key = match current.vau_ecies128(&entry.blob, &client_public_key) {
                    Ok(key) => key,
                    // an unusable key pair must not hide the ones after it
                    Err(ErpError::Hsm(e)) => {
                        warn!(blob_id = %entry.id, "ECIES key pair rejected by the HSM: {e}");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                match aes::decrypt(key.as_bytes(), &outer.iv, &outer.ciphertext, &outer.tag) {
                    Ok(plaintext) => {
                        debug!(blob_id = %entry.id, "VAU request decrypted");
                        opened = Some(plaintext);
                        break;
                    }
                    Err(CryptoError::Authentication) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            opened
        };
        let plaintext = plaintext.ok_or_else(|| {
            warn!(tried = keypairs.len(), "VAU request did not authenticate");
            ErpError::AuthenticationFailed("VAU request did not authenticate".into())
        })?;

        let inner = InnerTeeRequest::parse(&plaintext)?;
        let context = ResponseContext::new(
            inner.request_id,
            Some(inner.response_key.clone()),
            client_public_key,
        );
        Ok(DecryptedRequest { inner, context })
    }

    /// Symmetric under the response key when there is one, otherwise a new
    /// ECIES handshake against the client's key.
    pub fn encrypt(
        &self,
        response: Response<Vec<u8>>,
        context: &ResponseContext,
    ) -> ErpResult<Vec<u8>> {
        let plaintext = InnerTeeResponse {
            request_id: context.request_id,
            response,
        }
        .serialize();
        match &context.response_key {
            Some(key) => seal_symmetric(key, &plaintext),
            None => seal_asymmetric(&context.client_public_key, &plaintext),
        }
    }
}
