pub mod config;
pub mod error;
pub mod types;

pub use error::{ErpError, ErpResult};
pub use types::{Blob, BlobId, BlobType, TeeToken};
