//! Client side of the VAU transport, for tests and tooling

use erp_core::{ErpError, ErpResult};
use erp_crypto::{aes, random_bytes, Aes128Key, DiffieHellman, EcKeyPair, PublicKey, SymmetricKey};
use http::{Request, Response};

use crate::inner::{InnerTeeRequest, InnerTeeResponse, REQUEST_ID_SIZE};
use crate::jwt::Jwt;
use crate::outer::{OuterTeeRequest, OuterTeeResponse, VAU_VERSION};
use crate::protocol::open_symmetric;

struct Pending {
    ephemeral_secret: SymmetricKey<32>,
    request_id: [u8; REQUEST_ID_SIZE],
    response_key: Aes128Key,
}

pub struct ClientTeeProtocol {
    server_public_key: PublicKey,
    pending: Option<Pending>,
}

impl ClientTeeProtocol {
    pub fn new(server_public_key: PublicKey) -> Self {
        Self {
            server_public_key,
            pending: None,
        }
    }

    /// Encrypt `request` under a fresh ephemeral key, request id and
    /// response key.
    pub fn create_request(&mut self, jwt: &Jwt, request: Request<Vec<u8>>) -> ErpResult<Vec<u8>> {
        let mut request_id = [0u8; REQUEST_ID_SIZE];
        request_id.copy_from_slice(&random_bytes(REQUEST_ID_SIZE));
        let response_key = Aes128Key::generate();

        let plaintext = InnerTeeRequest {
            jwt: jwt.clone(),
            request_id,
            response_key: response_key.clone(),
            request,
        }
        .serialize();

        let ephemeral = EcKeyPair::generate();
        let ephemeral_secret = ephemeral.secret_bytes();
        let mut outer = OuterTeeRequest {
            version: VAU_VERSION,
            x: [0; 32],
            y: [0; 32],
            iv: aes::random_iv(),
            ciphertext: Vec::new(),
            tag: [0; 16],
        };
        outer.set_public_key(ephemeral.public_key())?;

        let mut dh = DiffieHellman::new();
        dh.set_private_public_key(ephemeral);
        dh.set_peer_public_key(self.server_public_key);
        let key = dh.create_transport_key()?;
        let sealed = aes::encrypt(key.as_bytes(), &outer.iv, &plaintext)?;
        outer.ciphertext = sealed.ciphertext;
        outer.tag = sealed.tag;

        self.pending = Some(Pending {
            ephemeral_secret,
            request_id,
            response_key,
        });
        Ok(outer.assemble())
    }

    pub fn request_id(&self) -> Option<&[u8; REQUEST_ID_SIZE]> {
        self.pending.as_ref().map(|p| &p.request_id)
    }

    /// Accepts both the symmetric and the asymmetric response form.
    pub fn parse_response(&self, wire: &[u8]) -> ErpResult<Response<Vec<u8>>> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| ErpError::MalformedInput("no request outstanding".into()))?;

        let plaintext = match open_symmetric(&pending.response_key, wire) {
            Ok(plaintext) => plaintext,
            Err(symmetric) => {
                let Ok(outer) = OuterTeeResponse::parse(wire) else {
                    return Err(symmetric);
                };
                let mut dh = DiffieHellman::new();
                dh.set_private_public_key(EcKeyPair::from_secret_bytes(
                    pending.ephemeral_secret.as_bytes(),
                )?);
                dh.set_peer_public_key(outer.public_key()?);
                let key = dh.create_transport_key()?;
                aes::decrypt(key.as_bytes(), &outer.iv, &outer.ciphertext, &outer.tag)?
            }
        };

        let inner = InnerTeeResponse::parse(&plaintext)?;
        if inner.request_id != pending.request_id {
            return Err(ErpError::AuthenticationFailed(
                "response belongs to another request".into(),
            ));
        }
        Ok(inner.response)
    }
}
