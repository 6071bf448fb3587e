use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::session::HsmSession;

/// Decides what happens to a session handed back by its user: recycled into
/// the pool, or dropped once the pool has been released.
pub struct SessionRemover {
    recycle: Box<dyn Fn(HsmSession) + Send + Sync>,
    released: AtomicBool,
}

impl SessionRemover {
    pub fn new(recycle: impl Fn(HsmSession) + Send + Sync + 'static) -> Self {
        Self {
            recycle: Box::new(recycle),
            released: AtomicBool::new(false),
        }
    }

    pub fn remove_session(&self, session: HsmSession) {
        if self.released.load(Ordering::SeqCst) {
            debug!(session = session.id(), "pool released, dropping session");
            return;
        }
        (self.recycle)(session);
    }

    pub fn notify_pool_release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn is_pool_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HsmClient;
    use crate::mock::MockHsmClient;
    use erp_blob::{BlobCache, MemoryBlobStore};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn session() -> HsmSession {
        let client = Arc::new(MockHsmClient::new());
        let cache = Arc::new(BlobCache::new(Box::new(MemoryBlobStore::new()), "test").unwrap());
        let raw = client.connect().unwrap();
        HsmSession::new(client, cache, raw)
    }

    #[test]
    fn test_recycles_until_release() {
        let recycled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&recycled);
        let remover = SessionRemover::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        remover.remove_session(session());
        assert_eq!(recycled.load(Ordering::SeqCst), 1);

        remover.notify_pool_release();
        assert!(remover.is_pool_released());
        remover.remove_session(session());
        remover.remove_session(session());
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
    }
}
