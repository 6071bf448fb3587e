//! Structural JWT envelope carried in the inner request
//!
//! Only the shape is checked here: three base64url segments, header and
//! claims decoding to JSON objects. Signature verification belongs to the
//! request processing that consumes the claims.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use erp_core::{ErpError, ErpResult};
use serde_json::{Map, Value};

#[derive(Clone, PartialEq)]
pub struct Jwt {
    serialized: String,
    header: Map<String, Value>,
    claims: Map<String, Value>,
}

fn decode_object(segment: &str, what: &str) -> ErpResult<Map<String, Value>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| ErpError::MalformedInput(format!("JWT {what} is not base64url: {e}")))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ErpError::MalformedInput(format!(
            "JWT {what} is not a JSON object"
        ))),
        Err(e) => Err(ErpError::MalformedInput(format!(
            "JWT {what} is not JSON: {e}"
        ))),
    }
}

impl Jwt {
    pub fn parse(serialized: &str) -> ErpResult<Self> {
        let mut segments = serialized.split('.');
        let (Some(header), Some(claims), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(ErpError::MalformedInput(
                "JWT must have three segments".into(),
            ));
        };
        let header = decode_object(header, "header")?;
        let claims = decode_object(claims, "claims")?;
        if signature.is_empty() {
            return Err(ErpError::MalformedInput("JWT is unsigned".into()));
        }
        URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| ErpError::MalformedInput(format!("JWT signature is not base64url: {e}")))?;
        Ok(Self {
            serialized: serialized.to_string(),
            header,
            claims,
        })
    }

    /// Build a token from its parts. The signature bytes are carried as
    /// given.
    pub fn compose(header: &Value, claims: &Value, signature: &[u8]) -> ErpResult<Self> {
        let encode = |v: &Value| -> ErpResult<String> {
            let json = serde_json::to_vec(v)
                .map_err(|e| ErpError::MalformedInput(format!("JWT segment: {e}")))?;
            Ok(URL_SAFE_NO_PAD.encode(json))
        };
        let serialized = format!(
            "{}.{}.{}",
            encode(header)?,
            encode(claims)?,
            URL_SAFE_NO_PAD.encode(signature)
        );
        Self::parse(&serialized)
    }

    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    pub fn string_claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    pub fn profession_oid(&self) -> Option<&str> {
        self.string_claim("professionOID")
    }

    pub fn id_number(&self) -> Option<&str> {
        self.string_claim("idNummer")
    }
}

impl std::fmt::Debug for Jwt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jwt")
            .field("alg", &self.header.get("alg"))
            .field("claims", &self.claims.keys().collect::<Vec<_>>())
            .finish()
    }
}
