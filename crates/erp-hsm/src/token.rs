//! TEE token acquisition and periodic refresh
//!
//! [`TeeTokenUpdater`] owns the current token and publishes it on a watch
//! channel. The pool reads the channel whenever it hands out a session, so a
//! refresh never touches sessions that are in use and never takes the pool
//! lock.

use erp_core::{ErpError, ErpResult, TeeToken};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::factory::HsmFactory;
use crate::mock::MOCK_QUOTE_PREFIX;

/// Produces attestation evidence (a TPM quote) over an HSM nonce.
pub trait Attestor: Send + Sync {
    fn attest(&self, nonce: &[u8]) -> ErpResult<Vec<u8>>;
}

/// Attestor accepted by the mock HSM.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockAttestor;

impl Attestor for MockAttestor {
    fn attest(&self, nonce: &[u8]) -> ErpResult<Vec<u8>> {
        Ok([MOCK_QUOTE_PREFIX, nonce].concat())
    }
}

/// Source of fresh TEE tokens.
pub trait TeeTokenSource: Send + Sync {
    fn fetch_token(&self) -> ErpResult<TeeToken>;
}

impl<F> TeeTokenSource for F
where
    F: Fn() -> ErpResult<TeeToken> + Send + Sync,
{
    fn fetch_token(&self) -> ErpResult<TeeToken> {
        self()
    }
}

/// Nonce, attestation, token exchange on a dedicated session.
pub struct HsmTeeTokenSource {
    factory: Arc<dyn HsmFactory>,
    attestor: Arc<dyn Attestor>,
}

impl HsmTeeTokenSource {
    pub fn new(factory: Arc<dyn HsmFactory>, attestor: Arc<dyn Attestor>) -> Self {
        Self { factory, attestor }
    }
}

impl TeeTokenSource for HsmTeeTokenSource {
    fn fetch_token(&self) -> ErpResult<TeeToken> {
        let mut session = self.factory.connect()?;
        let nonce = session.get_nonce()?;
        let attestation = self.attestor.attest(&nonce.nonce)?;
        session.get_tee_token(&nonce.blob, &attestation)
    }
}

pub struct TeeTokenUpdater {
    source: Arc<dyn TeeTokenSource>,
    sender: watch::Sender<Option<TeeToken>>,
    last_update: Mutex<Option<SystemTime>>,
    refresh_interval: Duration,
    retry_interval: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TeeTokenUpdater {
    pub fn new(
        source: Arc<dyn TeeTokenSource>,
        refresh_interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            source,
            sender,
            last_update: Mutex::new(None),
            refresh_interval,
            retry_interval,
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TeeToken>> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> Option<TeeToken> {
        self.sender.borrow().clone()
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch and publish a new token. Blocks on the device.
    pub fn update(&self) -> ErpResult<()> {
        let token = self.source.fetch_token()?;
        self.sender.send_replace(Some(token));
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Some(SystemTime::now());
        info!("TEE token updated");
        Ok(())
    }

    /// Refresh on a timer: `refresh_interval` after a success,
    /// `retry_interval` after a failure.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let updater = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut healthy = updater.current().is_some();
            loop {
                let delay = if healthy {
                    updater.refresh_interval
                } else {
                    updater.retry_interval
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let worker = Arc::clone(&updater);
                healthy = match tokio::task::spawn_blocking(move || worker.update()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(retry_secs = updater.retry_interval.as_secs(), "TEE token update failed: {e}");
                        false
                    }
                    Err(e) => {
                        error!("TEE token update task failed: {e}");
                        false
                    }
                };
            }
            debug!("TEE token updater stopped");
        });
        *slot = Some((cancel, handle));
    }

    pub fn stop(&self) {
        if let Some((cancel, _)) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
    }

    /// Age of the current token, for health reporting.
    pub fn token_age(&self) -> ErpResult<Duration> {
        let last = self
            .last_update()
            .ok_or_else(|| ErpError::HsmUnavailable("no TEE token yet".into()))?;
        Ok(SystemTime::now()
            .duration_since(last)
            .unwrap_or(Duration::ZERO))
    }
}

impl Drop for TeeTokenUpdater {
    fn drop(&mut self) {
        self.stop();
    }
}
