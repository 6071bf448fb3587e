//! Blob store backends
//!
//! Every backend keeps an in-memory table of entries ordered by id; the
//! durable backends write each change through before returning.

use erp_core::{BlobId, BlobType, ErpError, ErpResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::entry::{display_name, BlobEntry};

/// Durable storage of blob entries keyed by (type, name).
pub trait BlobStore: Send + Sync {
    /// Every entry, including expired ones and those of other releases.
    fn get_all_blobs_sorted_by_id(&self) -> ErpResult<Vec<BlobEntry>>;

    /// Persist `entry` under the next id. Fails with `Conflict` if
    /// (type, name) already exists.
    fn store_blob(&mut self, entry: BlobEntry) -> ErpResult<BlobId>;

    /// Fails with `NotFound` if (type, name) does not exist.
    fn delete_blob(&mut self, blob_type: BlobType, name: &[u8]) -> ErpResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Entries ordered by id plus the id counter. Ids are never reused, not even
/// after a delete.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct BlobTable {
    next_id: u32,
    entries: BTreeMap<BlobId, BlobEntry>,
}

impl BlobTable {
    fn find(&self, blob_type: BlobType, name: &[u8]) -> Option<BlobId> {
        self.entries
            .values()
            .find(|e| e.blob_type == blob_type && e.name == name)
            .map(|e| e.id)
    }

    fn insert(&mut self, mut entry: BlobEntry) -> ErpResult<BlobEntry> {
        if self.find(entry.blob_type, &entry.name).is_some() {
            return Err(ErpError::Conflict(format!(
                "{} blob '{}' already exists",
                entry.blob_type,
                entry.display_name()
            )));
        }
        let next = self
            .next_id
            .max(self.entries.keys().next_back().map_or(0, |id| id.0))
            .checked_add(1)
            .ok_or_else(|| ErpError::Storage("blob id space exhausted".into()))?;
        self.next_id = next;
        entry.id = BlobId(next);
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn remove(&mut self, blob_type: BlobType, name: &[u8]) -> ErpResult<BlobId> {
        let id = self.find(blob_type, name).ok_or_else(|| {
            ErpError::NotFound(format!(
                "{blob_type} blob '{}' does not exist",
                display_name(name)
            ))
        })?;
        self.entries.remove(&id);
        Ok(id)
    }

    fn sorted(&self) -> Vec<BlobEntry> {
        self.entries.values().cloned().collect()
    }
}

/// Volatile store for tests and mock deployments.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    table: BlobTable,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get_all_blobs_sorted_by_id(&self) -> ErpResult<Vec<BlobEntry>> {
        Ok(self.table.sorted())
    }

    fn store_blob(&mut self, entry: BlobEntry) -> ErpResult<BlobId> {
        Ok(self.table.insert(entry)?.id)
    }

    fn delete_blob(&mut self, blob_type: BlobType, name: &[u8]) -> ErpResult<()> {
        self.table.remove(blob_type, name).map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Serializes load-modify-flush across every JSON store handle in this
/// process.
static JSON_WRITE_LOCK: Mutex<()> = Mutex::new(());

/// JSON file store. The file is re-read on every operation and changes
/// rewrite the whole table using an atomic write (temp file, then rename).
///
/// Handles in one process may share a path: their writes are serialized and
/// each sees the others' entries. There is no file lock, so two processes
/// writing the same file can lose entries or reuse ids.
#[derive(Debug)]
pub struct JsonBlobStore {
    path: PathBuf,
}

impl JsonBlobStore {
    /// Open or create a JSON blob store at the given path.
    pub fn open(path: &Path) -> ErpResult<Self> {
        let store = Self {
            path: path.to_path_buf(),
        };
        let table = store.load()?;
        info!(
            path = %path.display(),
            entries = table.entries.len(),
            "JSON blob store opened"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> ErpResult<BlobTable> {
        if !self.path.exists() {
            return Ok(BlobTable::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| {
            ErpError::Storage(format!("parsing blob store {}: {e}", self.path.display()))
        })
    }

    fn flush(&self, table: &BlobTable) -> ErpResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(table)
            .map_err(|e| ErpError::Storage(format!("serializing blob store: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), "blob store flushed");
        Ok(())
    }
}

impl BlobStore for JsonBlobStore {
    fn get_all_blobs_sorted_by_id(&self) -> ErpResult<Vec<BlobEntry>> {
        Ok(self.load()?.sorted())
    }

    fn store_blob(&mut self, entry: BlobEntry) -> ErpResult<BlobId> {
        let _write = JSON_WRITE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = self.load()?;
        let stored = table.insert(entry)?;
        self.flush(&table)?;
        Ok(stored.id)
    }

    fn delete_blob(&mut self, blob_type: BlobType, name: &[u8]) -> ErpResult<()> {
        let _write = JSON_WRITE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = self.load()?;
        table.remove(blob_type, name)?;
        self.flush(&table)
    }

    fn backend_name(&self) -> &'static str {
        "json"
    }
}

#[cfg(feature = "rocksdb")]
pub use rocksdb_backend::RocksDbBlobStore;

#[cfg(feature = "rocksdb")]
mod rocksdb_backend {
    use super::*;

    const ENTRY_PREFIX: u8 = b'b';
    const NEXT_ID_KEY: &[u8] = b"meta:next_id";

    fn entry_key(id: BlobId) -> [u8; 5] {
        let mut key = [ENTRY_PREFIX; 5];
        key[1..].copy_from_slice(&id.0.to_be_bytes());
        key
    }

    fn storage_err(context: &str, e: impl std::fmt::Display) -> ErpError {
        ErpError::Storage(format!("{context}: {e}"))
    }

    /// RocksDB-backed store with an in-memory mirror.
    ///
    /// Keys are the big-endian entry id behind a one-byte prefix, so iteration
    /// order is id order. Writes go through to RocksDB before the mirror is
    /// updated.
    pub struct RocksDbBlobStore {
        db: rocksdb::DB,
        table: BlobTable,
    }

    impl RocksDbBlobStore {
        /// Open or create a RocksDB blob store at the given path.
        pub fn open(path: &Path) -> ErpResult<Self> {
            let mut opts = rocksdb::Options::default();
            opts.create_if_missing(true);

            let db = rocksdb::DB::open(&opts, path)
                .map_err(|e| storage_err(&format!("opening RocksDB {}", path.display()), e))?;

            let mut table = BlobTable::default();
            for item in db.prefix_iterator([ENTRY_PREFIX]) {
                let (key, value) = item.map_err(|e| storage_err("iterating RocksDB", e))?;
                if key.first() != Some(&ENTRY_PREFIX) {
                    break;
                }
                let entry: BlobEntry = serde_json::from_slice(&value)
                    .map_err(|e| storage_err("decoding blob entry", e))?;
                table.entries.insert(entry.id, entry);
            }
            if let Some(raw) = db
                .get(NEXT_ID_KEY)
                .map_err(|e| storage_err("reading id counter", e))?
            {
                let bytes: [u8; 4] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| ErpError::Storage("corrupt id counter".into()))?;
                table.next_id = u32::from_be_bytes(bytes);
            }

            info!(
                path = %path.display(),
                entries = table.entries.len(),
                "RocksDB blob store opened"
            );
            Ok(Self { db, table })
        }
    }

    impl BlobStore for RocksDbBlobStore {
        fn get_all_blobs_sorted_by_id(&self) -> ErpResult<Vec<BlobEntry>> {
            Ok(self.table.sorted())
        }

        fn store_blob(&mut self, entry: BlobEntry) -> ErpResult<BlobId> {
            let mut staged = self.table.clone();
            let stored = staged.insert(entry)?;
            let value = serde_json::to_vec(&stored)
                .map_err(|e| storage_err("encoding blob entry", e))?;

            let mut batch = rocksdb::WriteBatch::default();
            batch.put(entry_key(stored.id), value);
            batch.put(NEXT_ID_KEY, staged.next_id.to_be_bytes());
            self.db
                .write(batch)
                .map_err(|e| storage_err("writing blob entry", e))?;

            self.table = staged;
            Ok(stored.id)
        }

        fn delete_blob(&mut self, blob_type: BlobType, name: &[u8]) -> ErpResult<()> {
            let mut staged = self.table.clone();
            let id = staged.remove(blob_type, name)?;
            self.db
                .delete(entry_key(id))
                .map_err(|e| storage_err("deleting blob entry", e))?;
            self.table = staged;
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "rocksdb"
        }
    }
}

/// Pick a backend from the configured path: `:memory:`, `*.json`, or a
/// RocksDB directory when compiled with the `rocksdb` feature.
pub fn open_blob_store(path: &Path) -> ErpResult<Box<dyn BlobStore>> {
    if path.as_os_str() == ":memory:" {
        return Ok(Box::new(MemoryBlobStore::new()));
    }
    if path.extension().is_some_and(|ext| ext == "json") {
        return Ok(Box::new(JsonBlobStore::open(path)?));
    }

    #[cfg(feature = "rocksdb")]
    {
        Ok(Box::new(RocksDbBlobStore::open(path)?))
    }
    #[cfg(not(feature = "rocksdb"))]
    {
        Err(ErpError::Configuration(format!(
            "blob store {} needs the rocksdb feature (or use a .json path)",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erp_core::Blob;

    fn entry(blob_type: BlobType, name: &str) -> BlobEntry {
        BlobEntry::new(blob_type, name, Blob::new(name.as_bytes().to_vec(), 1))
    }

    #[test]
    fn test_ids_are_monotonic_and_not_reused() {
        let mut store = MemoryBlobStore::new();
        let a = store.store_blob(entry(BlobType::EciesKeypair, "a")).unwrap();
        let b = store.store_blob(entry(BlobType::EciesKeypair, "b")).unwrap();
        assert!(b > a);

        store.delete_blob(BlobType::EciesKeypair, b"b").unwrap();
        let c = store.store_blob(entry(BlobType::EciesKeypair, "c")).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_same_name_different_type_is_allowed() {
        let mut store = MemoryBlobStore::new();
        store.store_blob(entry(BlobType::KvnrHashKey, "k")).unwrap();
        store
            .store_blob(entry(BlobType::TelematikIdHashKey, "k"))
            .unwrap();
        assert!(matches!(
            store.store_blob(entry(BlobType::KvnrHashKey, "k")),
            Err(ErpError::Conflict(_))
        ));
    }

    #[test]
    fn test_delete_missing() {
        let mut store = MemoryBlobStore::new();
        assert!(matches!(
            store.delete_blob(BlobType::Quote, b"none"),
            Err(ErpError::NotFound(_))
        ));
    }

    #[test]
    fn test_json_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.json");

        let first_id = {
            let mut store = JsonBlobStore::open(&path).unwrap();
            let id = store
                .store_blob(entry(BlobType::TaskKeyDerivation, "task-1"))
                .unwrap();
            store
                .store_blob(entry(BlobType::TaskKeyDerivation, "task-2"))
                .unwrap();
            store
                .delete_blob(BlobType::TaskKeyDerivation, b"task-2")
                .unwrap();
            id
        };

        let mut reopened = JsonBlobStore::open(&path).unwrap();
        assert_eq!(reopened.path(), path.as_path());
        let all = reopened.get_all_blobs_sorted_by_id().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, first_id);
        assert_eq!(all[0].name, b"task-1");

        // the deleted id stays burnt across restarts
        let next = reopened
            .store_blob(entry(BlobType::TaskKeyDerivation, "task-3"))
            .unwrap();
        assert_eq!(next.0, first_id.0 + 2);
    }

    #[test]
    fn test_json_handles_on_one_path_write_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.json");

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let mut store = JsonBlobStore::open(&path).unwrap();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|n| {
                            let name = format!("w{writer}-{n}");
                            store
                                .store_blob(entry(BlobType::TaskKeyDerivation, &name))
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<BlobId> = writers
            .into_iter()
            .flat_map(|writer| writer.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 40);

        let all = JsonBlobStore::open(&path)
            .unwrap()
            .get_all_blobs_sorted_by_id()
            .unwrap();
        assert_eq!(all.len(), 40);
    }

    #[test]
    fn test_open_blob_store_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let memory = open_blob_store(Path::new(":memory:")).unwrap();
        assert_eq!(memory.backend_name(), "memory");
        let json = open_blob_store(&dir.path().join("b.json")).unwrap();
        assert_eq!(json.backend_name(), "json");
    }

    #[cfg(not(feature = "rocksdb"))]
    #[test]
    fn test_rocksdb_path_without_feature() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_blob_store(&dir.path().join("blobs.db")),
            Err(ErpError::Configuration(_))
        ));
    }

    #[cfg(feature = "rocksdb")]
    #[test]
    fn test_rocksdb_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.db");
        {
            let mut store = RocksDbBlobStore::open(&path).unwrap();
            store.store_blob(entry(BlobType::VauSig, "sig")).unwrap();
            store.store_blob(entry(BlobType::Quote, "q")).unwrap();
            store.delete_blob(BlobType::Quote, b"q").unwrap();
        }
        let mut store = RocksDbBlobStore::open(&path).unwrap();
        let all = store.get_all_blobs_sorted_by_id().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].blob_type, BlobType::VauSig);
        let id = store.store_blob(entry(BlobType::Quote, "q")).unwrap();
        assert_eq!(id, BlobId(3));
    }
}
