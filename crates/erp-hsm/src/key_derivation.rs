//! Per-record persistence keys and identifier hashes
//!
//! Insert path: the current derivation blob of the category plus a salt
//! chosen by the HSM. Read path: the blob id and salt stored with the
//! record, which reproduces the key even after the category has rotated to
//! a newer blob.

use erp_blob::BlobCache;
use erp_core::{BlobId, BlobType, ErpError, ErpResult};
use erp_crypto::hmac_sha256;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::pool::HsmPool;
pub use crate::session::DerivedKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivationCategory {
    Task,
    Communication,
    AuditLog,
    ChargeItem,
}

impl DerivationCategory {
    pub fn blob_type(self) -> BlobType {
        match self {
            DerivationCategory::Task => BlobType::TaskKeyDerivation,
            DerivationCategory::Communication => BlobType::CommunicationKeyDerivation,
            DerivationCategory::AuditLog => BlobType::AuditLogKeyDerivation,
            DerivationCategory::ChargeItem => BlobType::ChargeItemKeyDerivation,
        }
    }
}

/// What a record stores next to its ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationSecret {
    pub blob_id: BlobId,
    pub salt: Vec<u8>,
}

impl From<&DerivedKey> for DerivationSecret {
    fn from(key: &DerivedKey) -> Self {
        Self {
            blob_id: key.blob_id,
            salt: key.salt.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Kvnr,
    TelematikId,
}

impl IdentifierKind {
    pub fn blob_type(self) -> BlobType {
        match self {
            IdentifierKind::Kvnr => BlobType::KvnrHashKey,
            IdentifierKind::TelematikId => BlobType::TelematikIdHashKey,
        }
    }

    /// KVNR: one upper-case letter followed by nine digits.
    pub fn classify(identity: &str) -> Self {
        let bytes = identity.as_bytes();
        let is_kvnr = bytes.len() == 10
            && bytes[0].is_ascii_uppercase()
            && bytes[1..].iter().all(u8::is_ascii_digit);
        if is_kvnr {
            IdentifierKind::Kvnr
        } else {
            IdentifierKind::TelematikId
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedIdentifier {
    pub hash: [u8; 32],
    pub blob_id: BlobId,
}

/// `task id (i64 BE) || prescription type || authoredOn seconds (i64 BE)`
pub fn task_derivation_data(task_id: i64, prescription_type: u8, authored_on: SystemTime) -> Vec<u8> {
    let secs = match authored_on.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    let mut data = Vec::with_capacity(17);
    data.extend_from_slice(&task_id.to_be_bytes());
    data.push(prescription_type);
    data.extend_from_slice(&secs.to_be_bytes());
    data
}

/// `identity || hashed identity`
pub fn communication_derivation_data(identity: &str, hashed_identity: &[u8]) -> Vec<u8> {
    let mut data = identity.as_bytes().to_vec();
    data.extend_from_slice(hashed_identity);
    data
}

pub fn charge_item_derivation_data(prescription_id: &str) -> Vec<u8> {
    prescription_id.as_bytes().to_vec()
}

pub fn audit_log_derivation_data(hashed_kvnr: &[u8]) -> Vec<u8> {
    hashed_kvnr.to_vec()
}

/// Stateless front end over the pool; safe to share between threads.
#[derive(Clone)]
pub struct KeyDerivation {
    pool: Arc<HsmPool>,
}

impl KeyDerivation {
    pub fn new(pool: Arc<HsmPool>) -> Self {
        Self { pool }
    }

    fn cache(&self) -> &Arc<BlobCache> {
        self.pool.blob_cache()
    }

    /// Insert path when `existing` is `None`, read path otherwise.
    pub fn derive_key(
        &self,
        category: DerivationCategory,
        derivation_data: &[u8],
        existing: Option<&DerivationSecret>,
    ) -> ErpResult<DerivedKey> {
        let mut session = self.pool.acquire()?;
        let derived = session
            .derive_key(
                category.blob_type(),
                derivation_data,
                existing.map(|s| (s.blob_id, s.salt.as_slice())),
            )
            .map_err(|e| key_error(category, e))?;
        debug!(
            category = ?category,
            blob_id = %derived.blob_id,
            initial = existing.is_none(),
            "persistence key derived"
        );
        Ok(derived)
    }

    pub fn initial_key(
        &self,
        category: DerivationCategory,
        derivation_data: &[u8],
    ) -> ErpResult<DerivedKey> {
        self.derive_key(category, derivation_data, None)
    }

    pub fn key(
        &self,
        category: DerivationCategory,
        derivation_data: &[u8],
        secret: &DerivationSecret,
    ) -> ErpResult<DerivedKey> {
        self.derive_key(category, derivation_data, Some(secret))
    }

    /// Hash with the current key of `kind`.
    pub fn hash_identifier(&self, kind: IdentifierKind, identifier: &str) -> ErpResult<HashedIdentifier> {
        let entry = self
            .cache()
            .get_blob(kind.blob_type())
            .map_err(|e| ErpError::CryptographicKey(format!("no current {kind:?} hash key: {e}")))?;
        self.hash_with(entry.id, &entry.blob, identifier)
    }

    /// Hash with the key that produced an earlier hash.
    pub fn hash_identifier_with(
        &self,
        kind: IdentifierKind,
        identifier: &str,
        blob_id: BlobId,
    ) -> ErpResult<HashedIdentifier> {
        let entry = self
            .cache()
            .get_blob_by_id(kind.blob_type(), blob_id)
            .map_err(|e| ErpError::CryptographicKey(format!("{kind:?} hash key {blob_id}: {e}")))?;
        self.hash_with(entry.id, &entry.blob, identifier)
    }

    /// KVNR-shaped identities use the KVNR key, everything else the
    /// Telematik-ID key.
    pub fn hash_identity(&self, identity: &str) -> ErpResult<HashedIdentifier> {
        self.hash_identifier(IdentifierKind::classify(identity), identity)
    }

    fn hash_with(
        &self,
        blob_id: BlobId,
        blob: &erp_core::Blob,
        identifier: &str,
    ) -> ErpResult<HashedIdentifier> {
        let mut session = self.pool.acquire()?;
        let key = session
            .unwrap_hash_key(blob)
            .map_err(|e| match e {
                ErpError::HsmUnavailable(_) => e,
                other => ErpError::CryptographicKey(format!("unwrapping hash key: {other}")),
            })?;
        let hash = hmac_sha256(key.as_bytes(), identifier.as_bytes())?;
        Ok(HashedIdentifier { hash, blob_id })
    }
}

fn key_error(category: DerivationCategory, e: ErpError) -> ErpError {
    match e {
        ErpError::HsmUnavailable(_) => e,
        other => ErpError::CryptographicKey(format!("{category:?} key derivation failed: {other}")),
    }
}
