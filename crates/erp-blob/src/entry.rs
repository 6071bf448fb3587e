use erp_core::{Blob, BlobId, BlobType};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One stored blob plus its lifecycle metadata.
///
/// `(blob_type, name)` is unique within a store. `id` is assigned by the store
/// and ignored when an entry is handed to `store_blob`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobEntry {
    pub blob_type: BlobType,
    pub name: Vec<u8>,
    pub id: BlobId,
    pub blob: Blob,
    pub expiry: Option<SystemTime>,
    /// Start of the validity window (inclusive)
    pub start: Option<SystemTime>,
    /// End of the validity window (inclusive)
    pub end: Option<SystemTime>,
    /// TPM attestation key name (AttestationPublicKey)
    pub meta_ak_name: Option<Vec<u8>>,
    /// Accepted PCR indexes (Quote)
    pub pcr_set: Option<Vec<u8>>,
    /// Base64 DER certificate (VauSig)
    pub certificate: Option<String>,
    /// Build/release that stored the entry; `None` means visible to every release
    pub release: Option<String>,
}

impl BlobEntry {
    pub fn new(blob_type: BlobType, name: impl Into<Vec<u8>>, blob: Blob) -> Self {
        Self {
            blob_type,
            name: name.into(),
            id: BlobId(0),
            blob,
            expiry: None,
            start: None,
            end: None,
            meta_ak_name: None,
            pcr_set: None,
            certificate: None,
            release: None,
        }
    }

    pub fn with_expiry(mut self, expiry: SystemTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_validity(mut self, start: Option<SystemTime>, end: Option<SystemTime>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        if self.expiry.is_some_and(|expiry| now >= expiry) {
            return false;
        }
        if self.start.is_some_and(|start| now < start) {
            return false;
        }
        if self.end.is_some_and(|end| now > end) {
            return false;
        }
        true
    }

    pub fn is_visible_to(&self, release: &str) -> bool {
        self.release.as_deref().map_or(true, |r| r == release)
    }

    /// Printable form of the name for logs and error messages.
    pub fn display_name(&self) -> String {
        display_name(&self.name)
    }
}

pub(crate) fn display_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}
