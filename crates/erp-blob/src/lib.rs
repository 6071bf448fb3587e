//! erp-blob: persistence and caching of HSM-wrapped blobs
//!
//! Backends (all implement [`BlobStore`]):
//!   - [`MemoryBlobStore`]: process-local, used by tests and mock deployments
//!   - [`JsonBlobStore`]: single JSON file, written atomically on every change
//!   - `RocksDbBlobStore`: RocksDB directory (feature: `rocksdb`)
//!
//! [`BlobCache`] sits in front of a store and answers "which blob of type X is
//! current right now" under the expiry, validity-window and release rules.

pub mod cache;
pub mod entry;
pub mod store;

pub use cache::{BlobCache, BlobInUse};
pub use entry::BlobEntry;
pub use store::{open_blob_store, BlobStore, JsonBlobStore, MemoryBlobStore};

#[cfg(feature = "rocksdb")]
pub use store::RocksDbBlobStore;
