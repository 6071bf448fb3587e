//! Validity-aware cache in front of a [`BlobStore`]
//!
//! Reads work on an immutable snapshot of the store. A keyed lookup that
//! misses rebuilds the snapshot once and retries, so blobs written by other
//! processes show up without waiting for the periodic refresher. Writes go
//! through the store lock and rebuild the snapshot before returning.

use erp_core::{BlobId, BlobType, ErpError, ErpResult};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entry::{display_name, BlobEntry};
use crate::store::BlobStore;

/// Answers whether a derivation key is still referenced by stored records.
pub trait BlobInUse: Send + Sync {
    fn is_blob_in_use(&self, id: BlobId) -> bool;
}

impl<F> BlobInUse for F
where
    F: Fn(BlobId) -> bool + Send + Sync,
{
    fn is_blob_in_use(&self, id: BlobId) -> bool {
        self(id)
    }
}

pub struct BlobCache {
    store: Mutex<Box<dyn BlobStore>>,
    snapshot: RwLock<Arc<Vec<BlobEntry>>>,
    release: String,
    in_use: RwLock<Option<Arc<dyn BlobInUse>>>,
    changes: watch::Sender<u64>,
}

impl BlobCache {
    pub fn new(store: Box<dyn BlobStore>, release: impl Into<String>) -> ErpResult<Self> {
        let initial = store.get_all_blobs_sorted_by_id()?;
        let (changes, _) = watch::channel(0);
        let release = release.into();
        info!(
            backend = store.backend_name(),
            release = %release,
            entries = initial.len(),
            "blob cache initialised"
        );
        Ok(Self {
            store: Mutex::new(store),
            snapshot: RwLock::new(Arc::new(initial)),
            release,
            in_use: RwLock::new(None),
            changes,
        })
    }

    /// Install the predicate that vetoes deletion of referenced derivation keys.
    pub fn set_blob_in_use(&self, predicate: Arc<dyn BlobInUse>) {
        *self.in_use.write().unwrap_or_else(PoisonError::into_inner) = Some(predicate);
    }

    pub fn release(&self) -> &str {
        &self.release
    }

    /// Change counter, bumped whenever the cached content changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Current entry of `blob_type`: valid now, visible to this release,
    /// highest id.
    pub fn get_blob(&self, blob_type: BlobType) -> ErpResult<BlobEntry> {
        self.lookup(|snapshot, now| {
            snapshot
                .iter()
                .filter(|e| e.blob_type == blob_type && self.is_readable(e, now))
                .max_by_key(|e| e.id)
                .cloned()
        })?
        .ok_or_else(|| ErpError::NotFound(format!("no valid {blob_type} blob")))
    }

    pub fn get_blob_by_name(&self, blob_type: BlobType, name: &[u8]) -> ErpResult<BlobEntry> {
        self.lookup(|snapshot, now| {
            snapshot
                .iter()
                .find(|e| e.blob_type == blob_type && e.name == name && self.is_readable(e, now))
                .cloned()
        })?
        .ok_or_else(|| {
            ErpError::NotFound(format!(
                "no valid {blob_type} blob named '{}'",
                display_name(name)
            ))
        })
    }

    /// Entry with a known id, as referenced by previously written records.
    ///
    /// Expiry and validity window are not applied: they decide which blob new
    /// records use, not whether old records stay readable.
    pub fn get_blob_by_id(&self, blob_type: BlobType, id: BlobId) -> ErpResult<BlobEntry> {
        let entry = self.get_blob_by_id_any_type(id)?;
        if entry.blob_type != blob_type {
            return Err(ErpError::NotFound(format!(
                "blob {id} is a {} blob, expected {blob_type}",
                entry.blob_type
            )));
        }
        Ok(entry)
    }

    pub fn get_blob_by_id_any_type(&self, id: BlobId) -> ErpResult<BlobEntry> {
        self.lookup(|snapshot, _| {
            snapshot
                .binary_search_by_key(&id, |e| e.id)
                .ok()
                .map(|i| &snapshot[i])
                .filter(|e| e.is_visible_to(&self.release))
                .cloned()
        })?
        .ok_or_else(|| ErpError::NotFound(format!("no blob with id {id}")))
    }

    /// Every stored entry, unfiltered, freshly read from the store.
    pub fn get_all_blobs_sorted_by_id(&self) -> ErpResult<Vec<BlobEntry>> {
        Ok(self.rebuild()?.as_ref().clone())
    }

    /// Valid ECIES key pairs, newest first.
    pub fn get_ecies_keypairs(&self) -> ErpResult<Vec<BlobEntry>> {
        let collect = |snapshot: &[BlobEntry], now: SystemTime| {
            snapshot
                .iter()
                .rev()
                .filter(|e| e.blob_type == BlobType::EciesKeypair && self.is_readable(e, now))
                .cloned()
                .collect::<Vec<_>>()
        };
        let found = collect(&self.current(), SystemTime::now());
        if !found.is_empty() {
            return Ok(found);
        }
        Ok(collect(&self.rebuild()?, SystemTime::now()))
    }

    /// Store a new entry. Release-bound types are tagged with the running
    /// release unless the caller set one.
    pub fn store_blob(&self, mut entry: BlobEntry) -> ErpResult<BlobId> {
        if entry.blob_type.is_release_bound() && entry.release.is_none() {
            entry.release = Some(self.release.clone());
        }
        let blob_type = entry.blob_type;
        let name = entry.display_name();

        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let id = store.store_blob(entry)?;
        self.replace_snapshot(store.get_all_blobs_sorted_by_id()?);
        drop(store);

        info!(blob_type = %blob_type, name = %name, id = %id, "blob stored");
        Ok(id)
    }

    pub fn delete_blob(&self, blob_type: BlobType, name: &[u8]) -> ErpResult<()> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);

        if blob_type.is_derivation_key() {
            let existing = store
                .get_all_blobs_sorted_by_id()?
                .into_iter()
                .find(|e| e.blob_type == blob_type && e.name == name);
            if let Some(existing) = existing {
                let in_use = self
                    .in_use
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if in_use.is_some_and(|p| p.is_blob_in_use(existing.id)) {
                    warn!(
                        blob_type = %blob_type,
                        id = %existing.id,
                        "refusing to delete derivation key still in use"
                    );
                    return Err(ErpError::Conflict(format!(
                        "{blob_type} blob '{}' is still in use",
                        display_name(name)
                    )));
                }
            }
        }

        store.delete_blob(blob_type, name)?;
        self.replace_snapshot(store.get_all_blobs_sorted_by_id()?);
        drop(store);

        info!(blob_type = %blob_type, name = %display_name(name), "blob deleted");
        Ok(())
    }

    /// One answer per requested type, duplicates answered independently.
    /// Any `false` is re-checked once against a fresh snapshot.
    pub fn has_valid_blobs_of_type(&self, types: &[BlobType]) -> Vec<bool> {
        let answer = |snapshot: &[BlobEntry], now: SystemTime| {
            types
                .iter()
                .map(|t| {
                    snapshot
                        .iter()
                        .any(|e| e.blob_type == *t && self.is_readable(e, now))
                })
                .collect::<Vec<_>>()
        };
        let found = answer(&self.current(), SystemTime::now());
        if found.iter().all(|v| *v) {
            return found;
        }
        match self.rebuild() {
            Ok(rebuilt) => answer(&rebuilt, SystemTime::now()),
            Err(e) => {
                warn!("blob cache rebuild failed: {e}");
                found
            }
        }
    }

    /// Re-read the store and swap in a new snapshot.
    pub fn rebuild(&self) -> ErpResult<Arc<Vec<BlobEntry>>> {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = store.get_all_blobs_sorted_by_id()?;
        drop(store);
        Ok(self.replace_snapshot(entries))
    }

    /// Rebuild every `interval` until `cancel` fires.
    pub fn start_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.rebuild() {
                            warn!("blob cache refresh failed: {e}");
                        }
                    }
                }
            }
            debug!("blob cache refresher stopped");
        })
    }

    fn is_readable(&self, entry: &BlobEntry, now: SystemTime) -> bool {
        entry.is_valid_at(now) && entry.is_visible_to(&self.release)
    }

    fn current(&self) -> Arc<Vec<BlobEntry>> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn lookup<T>(&self, find: impl Fn(&[BlobEntry], SystemTime) -> Option<T>) -> ErpResult<Option<T>> {
        if let Some(found) = find(&self.current(), SystemTime::now()) {
            return Ok(Some(found));
        }
        let rebuilt = self.rebuild()?;
        Ok(find(&rebuilt, SystemTime::now()))
    }

    fn replace_snapshot(&self, entries: Vec<BlobEntry>) -> Arc<Vec<BlobEntry>> {
        let fresh = Arc::new(entries);
        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let changed = **slot != *fresh;
        *slot = Arc::clone(&fresh);
        drop(slot);
        if changed {
            self.changes.send_modify(|n| *n += 1);
            debug!(entries = fresh.len(), "blob cache snapshot replaced");
        }
        fresh
    }
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("release", &self.release)
            .field("entries", &self.current().len())
            .finish()
    }
}
