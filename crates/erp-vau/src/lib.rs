//! erp-vau: the VAU transport between clients and the trust core
//!
//! ```text
//! client                                   server
//!   InnerTeeRequest ── ECIES ──▶ OuterTeeRequest ──▶ TeeProtocol::decrypt (HSM ECDH)
//!   Response       ◀── AES-GCM(response key) ───────  TeeProtocol::encrypt
//! ```

pub mod client;
pub mod http1;
pub mod inner;
pub mod jwt;
pub mod outer;
pub mod protocol;

pub use client::ClientTeeProtocol;
pub use inner::{InnerTeeRequest, InnerTeeResponse, REQUEST_ID_SIZE};
pub use jwt::Jwt;
pub use outer::{OuterTeeRequest, OuterTeeResponse, MINIMUM_SIZE, VAU_VERSION};
pub use protocol::{DecryptedRequest, ResponseContext, TeeProtocol};
