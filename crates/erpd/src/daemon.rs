//! Daemon lifecycle: trust core wiring, background tasks, HTTP server

use anyhow::{Context, Result};
use axum::Router;
use erp_blob::{open_blob_store, BlobCache};
use erp_core::config::ErpConfig;
use erp_hsm::{
    create_factory, HsmPool, HsmTeeTokenSource, KeyDerivation, MockAttestor, PoolConfig, Seeder,
    TeeTokenUpdater,
};
use erp_vau::TeeProtocol;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::vau::{InnerRequestHandler, NotImplementedHandler};

/// Trust core services available to request processing.
#[derive(Clone)]
pub struct Services {
    pub blob_cache: Arc<BlobCache>,
    pub key_derivation: KeyDerivation,
    pub seeder: Arc<Seeder>,
}

/// Shared state of every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub pool: Arc<HsmPool>,
    pub updater: Arc<TeeTokenUpdater>,
    pub protocol: TeeProtocol,
    pub handler: Arc<dyn InnerRequestHandler>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn blob_cache(&self) -> &Arc<BlobCache> {
        &self.services.blob_cache
    }
}

/// Open the store, connect the HSM and fetch the first TEE token.
///
/// A failed first token fetch is logged, not fatal: the updater keeps
/// retrying and `/readyz` reports not ready until it succeeds.
pub fn build_state(config: &ErpConfig, handler: Arc<dyn InnerRequestHandler>) -> Result<AppState> {
    let store = open_blob_store(&config.blob_store.path)
        .with_context(|| format!("opening blob store {}", config.blob_store.path.display()))?;
    let blob_cache = Arc::new(BlobCache::new(store, config.blob_store.release.clone())?);
    info!(
        path = %config.blob_store.path.display(),
        release = %config.blob_store.release,
        "blob cache ready"
    );

    let factory = create_factory(&config.hsm, Arc::clone(&blob_cache))?;

    let source = HsmTeeTokenSource::new(Arc::clone(&factory), Arc::new(MockAttestor));
    let updater = Arc::new(TeeTokenUpdater::new(
        Arc::new(source),
        config.hsm.tee_token_refresh(),
        config.hsm.tee_token_retry(),
    ));
    if let Err(e) = updater.update() {
        warn!("initial TEE token fetch failed: {e}  (retrying in background)");
    }

    let pool = Arc::new(HsmPool::new(
        factory,
        updater.subscribe(),
        PoolConfig::from(&config.hsm),
    ));
    let seeder = Arc::new(Seeder::new(pool.clone(), &config.seeder)?);

    Ok(AppState {
        services: Services {
            blob_cache,
            key_derivation: KeyDerivation::new(Arc::clone(&pool)),
            seeder,
        },
        protocol: TeeProtocol::new(Arc::clone(&pool)),
        pool,
        updater,
        handler,
        metrics: Arc::new(Metrics::new()),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(crate::admin::routes())
        .merge(crate::vau::routes())
        .merge(crate::metrics::routes())
        .with_state(state)
}

pub async fn run(config: ErpConfig) -> Result<()> {
    info!("daemon starting");

    let state = tokio::task::block_in_place(|| build_state(&config, Arc::new(NotImplementedHandler)))?;

    // ── Background tasks ─────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let refresher = config.blob_store.refresh_interval_secs.map(|secs| {
        info!(interval_secs = secs, "blob cache refresher started");
        state
            .blob_cache()
            .start_refresher(Duration::from_secs(secs), cancel.child_token())
    });
    state.updater.start();
    state.pool.start_keep_alive();

    notify_ready();

    // ── HTTP server ──────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.daemon.listen)
        .await
        .with_context(|| format!("bind {}", config.daemon.listen))?;
    info!(
        addr = %config.daemon.listen,
        "listening on /Enrolment, /VAU, /health, /healthz, /readyz, /metrics"
    );

    let pool = Arc::clone(&state.pool);
    let updater = Arc::clone(&state.updater);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server")?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    cancel.cancel();
    if let Some(handle) = refresher {
        let _ = handle.await;
    }
    updater.stop();
    pool.release_pool();
    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op without $NOTIFY_SOCKET
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use erp_core::config::{BlobStoreConfig, HsmBackend, HsmConfig};

    pub(crate) fn test_config() -> ErpConfig {
        ErpConfig {
            blob_store: BlobStoreConfig {
                path: ":memory:".into(),
                release: "test".into(),
                refresh_interval_secs: None,
            },
            ..ErpConfig::default()
        }
    }

    pub(crate) fn test_state() -> AppState {
        build_state(&test_config(), Arc::new(NotImplementedHandler)).unwrap()
    }

    #[test]
    fn test_build_state_with_mock_backend() {
        let state = test_state();
        assert!(state.updater.current().is_some());
        assert_eq!(state.pool.max_session_count(), 5);
        assert_eq!(state.services.seeder.get_next_seed().unwrap().len(), 32);
    }

    #[test]
    fn test_production_backend_refuses_to_start() {
        let mut config = test_config();
        config.hsm = HsmConfig {
            backend: HsmBackend::Production,
            ..HsmConfig::default()
        };
        assert!(build_state(&config, Arc::new(NotImplementedHandler)).is_err());
    }

    #[test]
    fn test_json_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.blob_store.path = dir.path().join("blobs.json");

        let first = build_state(&config, Arc::new(NotImplementedHandler)).unwrap();
        let hashed = first.services.key_derivation.hash_identity("X123456789").unwrap();
        first.pool.release_pool();
        drop(first);

        let second = build_state(&config, Arc::new(NotImplementedHandler)).unwrap();
        let again = second.services.key_derivation.hash_identity("X123456789").unwrap();
        assert_eq!(again, hashed);
    }
}
