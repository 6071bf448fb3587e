//! Outer VAU message: the ECIES envelope around an inner request or response
//!
//! ```text
//! version:1 | x:32 | y:32 | iv:12 | ciphertext:var | tag:16
//! ```

use erp_core::{ErpError, ErpResult};
use erp_crypto::{ecdh, PublicKey, COORDINATE_SIZE, IV_SIZE, TAG_SIZE};

pub const VAU_VERSION: u8 = 1;

const HEADER_SIZE: usize = 1 + 2 * COORDINATE_SIZE + IV_SIZE;

/// Shortest well-formed message: header and tag around an empty ciphertext.
pub const MINIMUM_SIZE: usize = HEADER_SIZE + TAG_SIZE;

#[derive(Clone, PartialEq, Eq)]
pub struct OuterTeeRequest {
    pub version: u8,
    pub x: [u8; COORDINATE_SIZE],
    pub y: [u8; COORDINATE_SIZE],
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

/// Asymmetric responses use the same envelope, keyed to the server's
/// ephemeral key.
pub type OuterTeeResponse = OuterTeeRequest;

impl OuterTeeRequest {
    pub fn parse(wire: &[u8]) -> ErpResult<Self> {
        if wire.is_empty() {
            return Err(ErpError::MalformedInput("empty VAU message".into()));
        }
        if wire.len() < MINIMUM_SIZE {
            return Err(ErpError::MalformedInput(format!(
                "VAU message of {} bytes, need at least {MINIMUM_SIZE}",
                wire.len()
            )));
        }
        if wire[0] != VAU_VERSION {
            return Err(ErpError::MalformedInput(format!(
                "unsupported VAU version {}",
                wire[0]
            )));
        }

        let (header, rest) = wire.split_at(HEADER_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
        let mut x = [0u8; COORDINATE_SIZE];
        let mut y = [0u8; COORDINATE_SIZE];
        let mut iv = [0u8; IV_SIZE];
        let mut tag_bytes = [0u8; TAG_SIZE];
        x.copy_from_slice(&header[1..1 + COORDINATE_SIZE]);
        y.copy_from_slice(&header[1 + COORDINATE_SIZE..1 + 2 * COORDINATE_SIZE]);
        iv.copy_from_slice(&header[1 + 2 * COORDINATE_SIZE..]);
        tag_bytes.copy_from_slice(tag);

        Ok(Self {
            version: wire[0],
            x,
            y,
            iv,
            ciphertext: ciphertext.to_vec(),
            tag: tag_bytes,
        })
    }

    pub fn assemble(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(MINIMUM_SIZE + self.ciphertext.len());
        wire.push(self.version);
        wire.extend_from_slice(&self.x);
        wire.extend_from_slice(&self.y);
        wire.extend_from_slice(&self.iv);
        wire.extend_from_slice(&self.ciphertext);
        wire.extend_from_slice(&self.tag);
        wire
    }

    /// The sender's ephemeral key; points off the curve are malformed input.
    pub fn public_key(&self) -> ErpResult<PublicKey> {
        Ok(ecdh::public_key_from_xy(&self.x, &self.y)?)
    }

    pub fn set_public_key(&mut self, public: &PublicKey) -> ErpResult<()> {
        let (x, y) = ecdh::padded_xy(public)?;
        self.x = x;
        self.y = y;
        Ok(())
    }
}

impl std::fmt::Debug for OuterTeeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OuterTeeRequest")
            .field("version", &self.version)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}
