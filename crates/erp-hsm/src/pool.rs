//! Bounded pool of HSM sessions
//!
//! `acquire` hands out an idle session, or opens a new one while the pool is
//! below `max_session_count`, or waits (bounded) for one to come back. The
//! slow connect runs on a helper thread and the acquire deadline bounds the
//! wait for it as well. Returned sessions go back to the
//! idle set unless they were invalidated; sessions dropped during a panic
//! count as invalidated.

use erp_blob::BlobCache;
use erp_core::config::HsmConfig;
use erp_core::{ErpError, ErpResult, TeeToken};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::MAX_RANDOM_BYTES;
use crate::factory::HsmFactory;
use crate::remover::SessionRemover;
use crate::seeder::RandomSource;
use crate::session::HsmSession;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_session_count: usize,
    pub acquire_timeout: Duration,
    pub connect_attempts: u32,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&HsmConfig::default())
    }
}

impl From<&HsmConfig> for PoolConfig {
    fn from(config: &HsmConfig) -> Self {
        Self {
            max_session_count: config.max_session_count,
            acquire_timeout: config.acquire_timeout(),
            connect_attempts: config.connect_attempts,
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        self.idle_timeout / 4
    }

    pub fn keep_alive_threshold(&self) -> Duration {
        self.idle_timeout / 2
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<HsmSession>,
    active: usize,
    connecting: usize,
    max_used: usize,
    released: bool,
}

impl PoolState {
    fn mark_active(&mut self) {
        self.active += 1;
        self.max_used = self.max_used.max(self.active);
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    returned: Condvar,
    factory: Arc<dyn HsmFactory>,
    tee_token: watch::Receiver<Option<TeeToken>>,
    config: PoolConfig,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn activate(&self, mut session: HsmSession) -> HsmSession {
        session.set_tee_token(self.tee_token.borrow().clone());
        session
    }

    fn connect(&self) -> ErpResult<HsmSession> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.factory.connect() {
                Ok(session) => {
                    debug!(session = session.id(), attempt, "HSM session connected");
                    return Ok(session);
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, attempts, "HSM connect failed: {e}");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ErpError::HsmUnavailable(format!(
            "no HSM connection after {attempts} attempts: {}",
            last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        )))
    }

    /// Connects on a helper thread so the caller's deadline bounds the wait.
    /// The new session lands in the idle set, however late it arrives. A
    /// failure is sent on the returned channel under the pool lock, so a
    /// waiter that checked the channel cannot miss the wake-up.
    fn spawn_connect(self: Arc<Self>) -> ErpResult<Receiver<ErpError>> {
        let (failed, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("hsm-connect".into())
            .spawn(move || {
                let connected = self.connect();
                let discarded = {
                    let mut state = self.lock();
                    state.connecting = state.connecting.saturating_sub(1);
                    match connected {
                        Ok(session) if !state.released => {
                            state.idle.push_back(session);
                            None
                        }
                        Ok(session) => Some(session),
                        Err(e) => {
                            let _ = failed.send(e);
                            None
                        }
                    }
                };
                self.returned.notify_all();
                if let Some(session) = discarded {
                    debug!(session = session.id(), "discarding HSM session of a released pool");
                }
            })
            .map_err(|e| ErpError::HsmUnavailable(format!("cannot start HSM connect: {e}")))?;
        Ok(receiver)
    }

    /// Recycle path of the session remover.
    fn return_session(&self, mut session: HsmSession) {
        if session.is_valid() {
            session.keep_alive(self.config.keep_alive_threshold());
        }
        let discarded = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            if session.is_valid() && !state.released {
                state.idle.push_back(session);
                None
            } else {
                Some(session)
            }
        };
        self.returned.notify_one();
        if let Some(session) = discarded {
            debug!(session = session.id(), "discarding HSM session");
        }
    }

    /// Ping every idle session that has been quiet for half the idle timeout.
    fn keep_alive_idle(&self) {
        let sessions: Vec<HsmSession> = {
            let mut state = self.lock();
            let taken: Vec<_> = state.idle.drain(..).collect();
            state.active += taken.len();
            taken
        };
        if sessions.is_empty() {
            return;
        }
        debug!(count = sessions.len(), "keep-alive for idle HSM sessions");
        for session in sessions {
            self.return_session(session);
        }
    }
}

/// A session on loan from the pool. Dereferences to [`HsmSession`]; dropping
/// it hands the session back.
pub struct PooledSession {
    session: Option<HsmSession>,
    remover: Arc<SessionRemover>,
}

impl Deref for PooledSession {
    type Target = HsmSession;

    fn deref(&self) -> &HsmSession {
        self.session
            .as_ref()
            .expect("pooled session is present until drop")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut HsmSession {
        self.session
            .as_mut()
            .expect("pooled session is present until drop")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if std::thread::panicking() {
                session.invalidate();
            }
            self.remover.remove_session(session);
        }
    }
}

pub struct HsmPool {
    shared: Arc<PoolShared>,
    remover: Arc<SessionRemover>,
    keep_alive: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HsmPool {
    pub fn new(
        factory: Arc<dyn HsmFactory>,
        tee_token: watch::Receiver<Option<TeeToken>>,
        config: PoolConfig,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            returned: Condvar::new(),
            factory,
            tee_token,
            config,
        });
        let weak: Weak<PoolShared> = Arc::downgrade(&shared);
        let remover = Arc::new(SessionRemover::new(move |session| {
            if let Some(shared) = weak.upgrade() {
                shared.return_session(session);
            }
        }));
        info!(
            max_sessions = shared.config.max_session_count,
            "HSM pool created"
        );
        Self {
            shared,
            remover,
            keep_alive: Mutex::new(None),
        }
    }

    pub fn acquire(&self) -> ErpResult<PooledSession> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.acquire_timeout;
        let mut pending: Option<Receiver<ErpError>> = None;
        let mut state = shared.lock();
        loop {
            if state.released {
                return Err(ErpError::HsmUnavailable("HSM pool has been released".into()));
            }
            if let Some(session) = state.idle.pop_front() {
                state.mark_active();
                drop(state);
                return Ok(self.loan(shared.activate(session)));
            }
            match pending.as_ref().map(Receiver::try_recv) {
                Some(Ok(e)) => return Err(e),
                // the connect succeeded and its session went to the idle set
                Some(Err(TryRecvError::Disconnected)) => pending = None,
                Some(Err(TryRecvError::Empty)) | None => {}
            }
            if pending.is_none()
                && state.active + state.connecting < shared.config.max_session_count
            {
                state.connecting += 1;
                match Arc::clone(shared).spawn_connect() {
                    Ok(failed) => pending = Some(failed),
                    Err(e) => {
                        state.connecting -= 1;
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    active = state.active,
                    max = shared.config.max_session_count,
                    connecting = pending.is_some(),
                    "timed out waiting for an HSM session"
                );
                return Err(ErpError::HsmUnavailable(
                    "timed out waiting for a free HSM session".into(),
                ));
            }
            state = shared
                .returned
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn loan(&self, session: HsmSession) -> PooledSession {
        PooledSession {
            session: Some(session),
            remover: Arc::clone(&self.remover),
        }
    }

    /// Stop handing out sessions. Idle sessions are closed now; sessions in
    /// use are closed when they come back.
    pub fn release_pool(&self) {
        let idle: Vec<HsmSession> = {
            let mut state = self.shared.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.idle.drain(..).collect()
        };
        self.remover.notify_pool_release();
        self.shared.returned.notify_all();
        self.stop_keep_alive();
        info!(closed = idle.len(), "HSM pool released");
        drop(idle);
    }

    pub fn is_released(&self) -> bool {
        self.shared.lock().released
    }

    /// Periodically ping idle sessions; needs a tokio runtime.
    pub fn start_keep_alive(&self) {
        let interval = self.shared.config.keep_alive_interval();
        if interval.is_zero() {
            warn!("idle timeout too small, HSM keep-alive disabled");
            return;
        }
        let mut slot = self.keep_alive.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        if let Err(e) = tokio::task::spawn_blocking(move || shared.keep_alive_idle()).await {
                            warn!("HSM keep-alive task failed: {e}");
                        }
                    }
                }
            }
            debug!("HSM keep-alive stopped");
        });
        *slot = Some((cancel, handle));
        info!(interval_secs = interval.as_secs(), "HSM keep-alive started");
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
    }

    fn stop_keep_alive(&self) {
        if let Some((cancel, _)) = self
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }

    /// Run `f` with a pooled session; the session goes back even if `f`
    /// panics (as invalid) or returns an error.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut HsmSession) -> ErpResult<T>,
    ) -> ErpResult<T> {
        let mut session = self.acquire()?;
        f(&mut session)
    }

    pub fn active_session_count(&self) -> usize {
        self.shared.lock().active
    }

    pub fn inactive_session_count(&self) -> usize {
        self.shared.lock().idle.len()
    }

    pub fn max_used_session_count(&self) -> usize {
        self.shared.lock().max_used
    }

    pub fn reset_max_used_session_count(&self) {
        let mut state = self.shared.lock();
        state.max_used = state.active;
    }

    pub fn max_session_count(&self) -> usize {
        self.shared.config.max_session_count
    }

    pub fn blob_cache(&self) -> &Arc<BlobCache> {
        self.shared.factory.blob_cache()
    }

    pub fn tee_token(&self) -> Option<TeeToken> {
        self.shared.tee_token.borrow().clone()
    }
}

impl RandomSource for HsmPool {
    /// Assembled from as many device calls as the per-call limit requires.
    fn random_bytes(&self, count: usize) -> ErpResult<Vec<u8>> {
        let mut session = self.acquire()?;
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let chunk = (count - out.len()).min(MAX_RANDOM_BYTES);
            out.extend(session.random(chunk)?);
        }
        Ok(out)
    }
}

impl Drop for HsmPool {
    fn drop(&mut self) {
        self.release_pool();
    }
}
