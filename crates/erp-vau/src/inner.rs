//! Decrypted VAU payloads
//!
//! Request: `"1" SP JWT SP hex(request id) SP hex(response key) SP HTTP-request`
//! Response: `"1" SP hex(request id) SP HTTP-response`

use erp_core::{ErpError, ErpResult};
use erp_crypto::Aes128Key;
use http::header::AUTHORIZATION;
use http::{Request, Response};

use crate::http1;
use crate::jwt::Jwt;

pub const REQUEST_ID_SIZE: usize = 16;

const INNER_VERSION: &[u8] = b"1";

fn malformed(msg: impl Into<String>) -> ErpError {
    ErpError::MalformedInput(msg.into())
}

/// Next space-terminated token, and the rest after the single separator.
fn next_token<'a>(input: &'a [u8], what: &str) -> ErpResult<(&'a [u8], &'a [u8])> {
    let split = input
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| malformed(format!("inner message ends before {what}")))?;
    let token = &input[..split];
    if token.is_empty() {
        return Err(malformed(format!("empty {what}")));
    }
    Ok((token, &input[split + 1..]))
}

fn decode_hex16(token: &[u8], what: &str) -> ErpResult<[u8; REQUEST_ID_SIZE]> {
    let mut out = [0u8; REQUEST_ID_SIZE];
    hex::decode_to_slice(token, &mut out)
        .map_err(|_| malformed(format!("{what} must be {REQUEST_ID_SIZE} bytes of hex")))?;
    Ok(out)
}

fn check_version(token: &[u8]) -> ErpResult<()> {
    if token != INNER_VERSION {
        return Err(malformed(format!(
            "unsupported inner version {:?}",
            String::from_utf8_lossy(token)
        )));
    }
    Ok(())
}

pub struct InnerTeeRequest {
    pub jwt: Jwt,
    pub request_id: [u8; REQUEST_ID_SIZE],
    pub response_key: Aes128Key,
    pub request: Request<Vec<u8>>,
}

impl InnerTeeRequest {
    pub fn parse(plaintext: &[u8]) -> ErpResult<Self> {
        let (version, rest) = next_token(plaintext, "version")?;
        check_version(version)?;
        let (jwt, rest) = next_token(rest, "JWT")?;
        let jwt = std::str::from_utf8(jwt).map_err(|_| malformed("JWT is not UTF-8"))?;
        let jwt = Jwt::parse(jwt)?;
        let (request_id, rest) = next_token(rest, "request id")?;
        let request_id = decode_hex16(request_id, "request id")?;
        let (response_key, rest) = next_token(rest, "response key")?;
        let response_key = Aes128Key::from_bytes(decode_hex16(response_key, "response key")?);
        let request = http1::parse_request(rest)?;
        Ok(Self {
            jwt,
            request_id,
            response_key,
            request,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(INNER_VERSION);
        out.push(b' ');
        out.extend_from_slice(self.jwt.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(hex::encode(self.request_id).as_bytes());
        out.push(b' ');
        out.extend_from_slice(hex::encode(self.response_key.as_bytes()).as_bytes());
        out.push(b' ');
        out.extend(http1::serialize_request(&self.request));
        out
    }

    /// Raw value of the `Authorization: Bearer` header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.request
            .headers()
            .get(AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
    }

    pub fn request_id_hex(&self) -> String {
        hex::encode(self.request_id)
    }
}

impl std::fmt::Debug for InnerTeeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerTeeRequest")
            .field("request_id", &self.request_id_hex())
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("jwt", &self.jwt)
            .finish()
    }
}

#[derive(Debug)]
pub struct InnerTeeResponse {
    pub request_id: [u8; REQUEST_ID_SIZE],
    pub response: Response<Vec<u8>>,
}

impl InnerTeeResponse {
    pub fn parse(plaintext: &[u8]) -> ErpResult<Self> {
        let (version, rest) = next_token(plaintext, "version")?;
        check_version(version)?;
        let (request_id, rest) = next_token(rest, "request id")?;
        let request_id = decode_hex16(request_id, "request id")?;
        Ok(Self {
            request_id,
            response: http1::parse_response(rest)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(INNER_VERSION);
        out.push(b' ');
        out.extend_from_slice(hex::encode(self.request_id).as_bytes());
        out.push(b' ');
        out.extend(http1::serialize_response(&self.response));
        out
    }
}
