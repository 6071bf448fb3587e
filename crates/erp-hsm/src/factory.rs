use erp_blob::BlobCache;
use erp_core::config::{HsmBackend, HsmConfig};
use erp_core::{ErpError, ErpResult};
use std::sync::Arc;
use tracing::info;

use crate::client::HsmClient;
use crate::mock::MockHsmClient;
use crate::session::HsmSession;

/// Opens new HSM sessions.
pub trait HsmFactory: Send + Sync {
    fn connect(&self) -> ErpResult<HsmSession>;

    fn blob_cache(&self) -> &Arc<BlobCache>;
}

/// Factory over any [`HsmClient`].
pub struct ClientHsmFactory {
    client: Arc<dyn HsmClient>,
    blob_cache: Arc<BlobCache>,
}

impl ClientHsmFactory {
    pub fn new(client: Arc<dyn HsmClient>, blob_cache: Arc<BlobCache>) -> Self {
        Self { client, blob_cache }
    }
}

impl HsmFactory for ClientHsmFactory {
    fn connect(&self) -> ErpResult<HsmSession> {
        let raw = self.client.connect()?;
        Ok(HsmSession::new(
            Arc::clone(&self.client),
            Arc::clone(&self.blob_cache),
            raw,
        ))
    }

    fn blob_cache(&self) -> &Arc<BlobCache> {
        &self.blob_cache
    }
}

/// Build the factory for the configured backend.
///
/// The mock backend provisions any missing key material into the cache. The
/// production backend needs the vendor client, which this build does not
/// link.
pub fn create_factory(
    config: &HsmConfig,
    blob_cache: Arc<BlobCache>,
) -> ErpResult<Arc<dyn HsmFactory>> {
    match config.backend {
        HsmBackend::Mock => {
            let client = Arc::new(MockHsmClient::new());
            client.provision_blobs(&blob_cache)?;
            info!("using mock HSM backend");
            Ok(Arc::new(ClientHsmFactory::new(client, blob_cache)))
        }
        HsmBackend::Production => Err(ErpError::Configuration(
            "the production HSM backend is not available in this build".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erp_blob::MemoryBlobStore;
    use erp_core::BlobType;

    fn cache() -> Arc<BlobCache> {
        Arc::new(BlobCache::new(Box::new(MemoryBlobStore::new()), "test").unwrap())
    }

    #[test]
    fn test_mock_backend_provisions() {
        let cache = cache();
        let factory = create_factory(&HsmConfig::default(), cache.clone()).unwrap();
        assert!(cache.get_blob(BlobType::EciesKeypair).is_ok());
        let session = factory.connect().unwrap();
        assert!(session.is_valid());
    }

    #[test]
    fn test_production_backend_is_a_configuration_error() {
        let config = HsmConfig {
            backend: HsmBackend::Production,
            ..HsmConfig::default()
        };
        assert!(matches!(
            create_factory(&config, cache()),
            Err(ErpError::Configuration(_))
        ));
    }
}
