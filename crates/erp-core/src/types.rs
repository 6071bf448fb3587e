use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of HSM-wrapped key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlobType {
    EndorsementKey,
    AttestationKeyPair,
    AttestationPublicKey,
    Quote,
    EciesKeypair,
    TaskKeyDerivation,
    CommunicationKeyDerivation,
    AuditLogKeyDerivation,
    ChargeItemKeyDerivation,
    KvnrHashKey,
    TelematikIdHashKey,
    VauSig,
    PseudonameKey,
}

impl BlobType {
    pub const ALL: [BlobType; 13] = [
        BlobType::EndorsementKey,
        BlobType::AttestationKeyPair,
        BlobType::AttestationPublicKey,
        BlobType::Quote,
        BlobType::EciesKeypair,
        BlobType::TaskKeyDerivation,
        BlobType::CommunicationKeyDerivation,
        BlobType::AuditLogKeyDerivation,
        BlobType::ChargeItemKeyDerivation,
        BlobType::KvnrHashKey,
        BlobType::TelematikIdHashKey,
        BlobType::VauSig,
        BlobType::PseudonameKey,
    ];

    /// Stable numeric code, persisted by blob stores and mixed into key derivation.
    pub fn as_u8(self) -> u8 {
        match self {
            BlobType::EndorsementKey => 1,
            BlobType::AttestationKeyPair => 2,
            BlobType::AttestationPublicKey => 3,
            BlobType::Quote => 4,
            BlobType::EciesKeypair => 5,
            BlobType::TaskKeyDerivation => 6,
            BlobType::CommunicationKeyDerivation => 7,
            BlobType::AuditLogKeyDerivation => 8,
            BlobType::ChargeItemKeyDerivation => 9,
            BlobType::KvnrHashKey => 10,
            BlobType::TelematikIdHashKey => 11,
            BlobType::VauSig => 12,
            BlobType::PseudonameKey => 13,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_u8() == code)
    }

    /// Name used by the enrolment API path (`/Enrolment/<name>`).
    pub fn admin_name(self) -> &'static str {
        match self {
            BlobType::EndorsementKey => "KnownEndorsementKey",
            BlobType::AttestationKeyPair => "AttestationKeyPair",
            BlobType::AttestationPublicKey => "KnownAttestationKey",
            BlobType::Quote => "KnownQuote",
            BlobType::EciesKeypair => "EciesKeypair",
            BlobType::TaskKeyDerivation => "Task/DerivationKey",
            BlobType::CommunicationKeyDerivation => "Communication/DerivationKey",
            BlobType::AuditLogKeyDerivation => "AuditLog/DerivationKey",
            BlobType::ChargeItemKeyDerivation => "ChargeItem/DerivationKey",
            BlobType::KvnrHashKey => "KvnrHashKey",
            BlobType::TelematikIdHashKey => "TelematikIdHashKey",
            BlobType::VauSig => "VauSig",
            BlobType::PseudonameKey => "PseudonameKey",
        }
    }

    pub fn from_admin_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.admin_name() == name)
    }

    /// Root keys from which per-record keys are derived.
    pub fn is_derivation_key(self) -> bool {
        matches!(
            self,
            BlobType::TaskKeyDerivation
                | BlobType::CommunicationKeyDerivation
                | BlobType::AuditLogKeyDerivation
                | BlobType::ChargeItemKeyDerivation
        )
    }

    /// Types whose entries are tied to the build that stored them.
    pub fn is_release_bound(self) -> bool {
        matches!(self, BlobType::Quote)
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Store-assigned identifier of a blob entry; strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(pub u32);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BlobId {
    fn from(id: u32) -> Self {
        BlobId(id)
    }
}

/// Opaque HSM-wrapped payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub data: Vec<u8>,
    pub generation: u64,
}

impl Blob {
    pub fn new(data: impl Into<Vec<u8>>, generation: u64) -> Self {
        Self {
            data: data.into(),
            generation,
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.data.len())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Short-lived blob granting the right to run HSM operations.
#[derive(Clone, PartialEq, Eq)]
pub struct TeeToken(pub Blob);

impl TeeToken {
    pub fn as_blob(&self) -> &Blob {
        &self.0
    }
}

impl fmt::Debug for TeeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TeeToken").field(&"[REDACTED]").finish()
    }
}
