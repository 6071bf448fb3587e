//! P-256 key agreement for the VAU transport

use p256::{
    ecdh::diffie_hellman,
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    EncodedPoint, FieldBytes, SecretKey,
};
use rand::rngs::OsRng;

pub use p256::PublicKey;

use crate::error::{check_len, CryptoError, CryptoResult};
use crate::kdf::hkdf_sha256;
use crate::keys::{Aes128Key, SymmetricKey};
use crate::{COORDINATE_SIZE, VAU_HKDF_INFO};

/// A P-256 key pair. The secret half never appears in `Debug` output.
#[derive(Clone)]
pub struct EcKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl EcKeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Rebuild from a 32-byte big-endian scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        check_len("private scalar", COORDINATE_SIZE, bytes.len())?;
        let secret = SecretKey::from_slice(bytes)
            .map_err(|_| CryptoError::InvalidKey("scalar out of range".into()))?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    pub fn secret_bytes(&self) -> SymmetricKey<COORDINATE_SIZE> {
        let mut bytes = [0u8; COORDINATE_SIZE];
        bytes.copy_from_slice(&self.secret.to_bytes());
        let key = SymmetricKey::from_bytes(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl std::fmt::Debug for EcKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcKeyPair")
            .field("public", &hex_point(&self.public))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn hex_point(public: &PublicKey) -> String {
    hex::encode(public.to_encoded_point(true).as_bytes())
}

/// Affine coordinates, each left-padded to 32 bytes.
pub fn padded_xy(
    public: &PublicKey,
) -> CryptoResult<([u8; COORDINATE_SIZE], [u8; COORDINATE_SIZE])> {
    let point = public.to_encoded_point(false);
    let (Some(x), Some(y)) = (point.x(), point.y()) else {
        return Err(CryptoError::InvalidPoint);
    };
    let mut out_x = [0u8; COORDINATE_SIZE];
    let mut out_y = [0u8; COORDINATE_SIZE];
    out_x[COORDINATE_SIZE - x.len()..].copy_from_slice(x);
    out_y[COORDINATE_SIZE - y.len()..].copy_from_slice(y);
    Ok((out_x, out_y))
}

pub fn public_key_from_xy(x: &[u8], y: &[u8]) -> CryptoResult<PublicKey> {
    check_len("x coordinate", COORDINATE_SIZE, x.len())?;
    check_len("y coordinate", COORDINATE_SIZE, y.len())?;
    let point = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(x),
        FieldBytes::from_slice(y),
        false,
    );
    let public: Option<PublicKey> = PublicKey::from_encoded_point(&point).into();
    public.ok_or(CryptoError::InvalidPoint)
}

/// Uncompressed SEC1/X9.62 encoding (`04 || x || y`).
pub fn public_key_to_sec1(public: &PublicKey) -> Vec<u8> {
    public.to_encoded_point(false).as_bytes().to_vec()
}

pub fn public_key_from_sec1(bytes: &[u8]) -> CryptoResult<PublicKey> {
    PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPoint)
}

/// Stepwise ECDH: own key pair, then peer key, then the shared secret.
#[derive(Default)]
pub struct DiffieHellman {
    own: Option<EcKeyPair>,
    peer: Option<PublicKey>,
}

impl DiffieHellman {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_private_public_key(&mut self, pair: EcKeyPair) {
        self.own = Some(pair);
    }

    pub fn set_peer_public_key(&mut self, peer: PublicKey) {
        self.peer = Some(peer);
    }

    pub fn own_public_key(&self) -> Option<&PublicKey> {
        self.own.as_ref().map(EcKeyPair::public_key)
    }

    /// Raw x coordinate of the shared point.
    pub fn create_shared_key(&self) -> CryptoResult<SymmetricKey<COORDINATE_SIZE>> {
        let own = self
            .own
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidKey("own key pair not set".into()))?;
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidKey("peer public key not set".into()))?;
        let shared = diffie_hellman(own.secret.to_nonzero_scalar(), peer.as_affine());
        SymmetricKey::from_slice(shared.raw_secret_bytes())
    }

    /// Shared secret stretched into the AES-128 transport key.
    pub fn create_transport_key(&self) -> CryptoResult<Aes128Key> {
        let shared = self.create_shared_key()?;
        hkdf_sha256::<16>(shared.as_bytes(), None, VAU_HKDF_INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree() {
        let server = EcKeyPair::generate();
        let client = EcKeyPair::generate();

        let mut a = DiffieHellman::new();
        a.set_private_public_key(server.clone());
        a.set_peer_public_key(*client.public_key());

        let mut b = DiffieHellman::new();
        b.set_private_public_key(client);
        b.set_peer_public_key(*server.public_key());

        assert_eq!(a.create_shared_key().unwrap(), b.create_shared_key().unwrap());
        assert_eq!(
            a.create_transport_key().unwrap(),
            b.create_transport_key().unwrap()
        );
    }

    #[test]
    fn test_missing_keys() {
        let mut dh = DiffieHellman::new();
        assert!(dh.create_shared_key().is_err());
        dh.set_private_public_key(EcKeyPair::generate());
        assert!(matches!(
            dh.create_shared_key(),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_xy_roundtrip() {
        let pair = EcKeyPair::generate();
        let (x, y) = padded_xy(pair.public_key()).unwrap();
        let back = public_key_from_xy(&x, &y).unwrap();
        assert_eq!(&back, pair.public_key());
    }

    #[test]
    fn test_point_off_curve_rejected() {
        let pair = EcKeyPair::generate();
        let (x, mut y) = padded_xy(pair.public_key()).unwrap();
        y[31] ^= 1;
        assert!(matches!(
            public_key_from_xy(&x, &y),
            Err(CryptoError::InvalidPoint)
        ));
        assert!(matches!(
            public_key_from_xy(&x[..31], &y),
            Err(CryptoError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_secret_bytes_roundtrip() {
        let pair = EcKeyPair::generate();
        let restored = EcKeyPair::from_secret_bytes(pair.secret_bytes().as_bytes()).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
        assert!(EcKeyPair::from_secret_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_debug_shows_compressed_public_point_only() {
        let pair = EcKeyPair::generate();
        let rendered = format!("{pair:?}");
        let compressed = pair.public_key().to_encoded_point(true);
        assert!(rendered.contains(&hex::encode(compressed.as_bytes())));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains(&hex::encode(pair.secret_bytes().as_bytes())));
    }

    #[test]
    fn test_sec1_encoding() {
        let pair = EcKeyPair::generate();
        let encoded = public_key_to_sec1(pair.public_key());
        assert_eq!(encoded.len(), 65);
        assert_eq!(encoded[0], 0x04);
        assert_eq!(&public_key_from_sec1(&encoded).unwrap(), pair.public_key());
    }
}
