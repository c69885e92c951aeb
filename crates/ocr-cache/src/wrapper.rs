//! The safety wrapper: the only cache type application code should hold.
//!
//! `SafeCache` owns a [`CacheManager`] and guarantees that no cache problem
//! reaches the caller. Its lifecycle:
//!
//! ```text
//! Uninitialized ──initialize()──> Initializing ──┬──> Ready
//!                                                └──> Degraded
//! any state ──close() / drop──> Closed
//! ```
//!
//! - Initialization is single-flight: the first caller opens the engine under
//!   the phase lock; concurrent callers wait and observe the same outcome.
//!   There is exactly one attempt per instance.
//! - In `Degraded` and `Closed` every operation returns its benign default
//!   (`false`, `None`, an empty `Vec`) without crossing into the engine.
//! - A failing call leaves the cache `Ready` unless the engine reports the
//!   handle unusable, in which case the wrapper moves to `Degraded`.
//! - Panics inside the cache are caught and treated as failures.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{CacheConfig, InitMode};
use crate::error::{CacheError, CacheErrorKind, Operation, Result};
use crate::health::{CacheHealth, HealthInputs};
use crate::manager::CacheManager;
use crate::native::{EngineLoader, load_engine};
use crate::types::{CacheKey, ResultRecord, SessionRecord, StoreStats};

const HEALTH_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CacheState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Degraded = 3,
    Closed = 4,
}

impl CacheState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CacheState::Uninitialized,
            1 => CacheState::Initializing,
            2 => CacheState::Ready,
            3 => CacheState::Degraded,
            _ => CacheState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheState::Uninitialized => "uninitialized",
            CacheState::Initializing => "initializing",
            CacheState::Ready => "ready",
            CacheState::Degraded => "degraded",
            CacheState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Phase {
    Uninitialized,
    Ready(Arc<CacheManager>),
    Degraded(CacheError),
    Closed,
}

#[derive(Default)]
struct Diagnostics {
    loaded: bool,
    engine_abi: Option<u32>,
    init_error: Option<CacheError>,
    last_error: Option<CacheError>,
    recovery: Option<String>,
}

pub struct SafeCache {
    config: CacheConfig,
    loader: Arc<dyn EngineLoader>,
    phase: Mutex<Phase>,
    state: AtomicU8,
    diagnostics: Mutex<Diagnostics>,
}

impl SafeCache {
    /// Create an uninitialized cache. Performs no I/O.
    pub fn new(config: CacheConfig) -> Self {
        let loader = config.loader();
        Self::with_loader(config, loader)
    }

    /// Create an uninitialized cache that resolves its engine through `loader`.
    pub fn with_loader(config: CacheConfig, loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            config,
            loader,
            phase: Mutex::new(Phase::Uninitialized),
            state: AtomicU8::new(CacheState::Uninitialized as u8),
            diagnostics: Mutex::new(Diagnostics::default()),
        }
    }

    /// Create and initialize immediately.
    pub fn open(config: CacheConfig) -> Self {
        let cache = Self::new(config);
        cache.initialize();
        cache
    }

    /// Create as the configuration's `init` mode asks.
    pub fn from_config(config: CacheConfig) -> Self {
        let eager = config.init == InitMode::Eager;
        let cache = Self::new(config);
        if eager {
            cache.initialize();
        }
        cache
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CacheState::Ready
    }

    fn set_state(&self, state: CacheState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run the one initialization attempt if nobody has yet; returns the outcome.
    ///
    /// Idempotent. Concurrent callers block until the first attempt finishes.
    pub fn initialize(&self) -> CacheState {
        let state = self.state();
        if state != CacheState::Uninitialized && state != CacheState::Initializing {
            return state;
        }

        let mut phase = self.phase.lock();
        if !matches!(*phase, Phase::Uninitialized) {
            return self.state();
        }
        self.set_state(CacheState::Initializing);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.attempt_open()));
        let (next, state) = match outcome {
            Ok(Ok(manager)) => (Phase::Ready(Arc::new(manager)), CacheState::Ready),
            Ok(Err(err)) => (Phase::Degraded(err), CacheState::Degraded),
            Err(_) => {
                let err = CacheError::native_unavailable(Operation::LoadEngine, "panic during cache initialization");
                self.diagnostics.lock().init_error = Some(err.clone());
                (Phase::Degraded(err), CacheState::Degraded)
            }
        };

        if let Phase::Degraded(err) = &next {
            tracing::warn!("OCR cache disabled for this session: {}", err);
        }
        *phase = next;
        self.set_state(state);
        state
    }

    fn attempt_open(&self) -> Result<CacheManager> {
        let loaded = load_engine(self.loader.as_ref()).inspect_err(|err| {
            self.diagnostics.lock().init_error = Some(err.clone());
        })?;
        {
            let mut diagnostics = self.diagnostics.lock();
            diagnostics.loaded = true;
            diagnostics.engine_abi = Some(loaded.abi_version);
        }

        let manager = CacheManager::open(loaded.api, &self.config);
        let mut diagnostics = self.diagnostics.lock();
        if let Some(err) = manager.init_error() {
            diagnostics.init_error = Some(err.clone());
            return Err(err);
        }
        diagnostics.recovery = manager.recovery_note().map(str::to_string);
        Ok(manager)
    }

    /// The manager, if ready. The phase lock is released before returning.
    fn manager(&self) -> Option<Arc<CacheManager>> {
        if self.initialize() != CacheState::Ready {
            return None;
        }
        match &*self.phase.lock() {
            Phase::Ready(manager) => Some(Arc::clone(manager)),
            _ => None,
        }
    }

    fn run<T: Default>(&self, operation: Operation, f: impl FnOnce(&CacheManager) -> Result<T>) -> T {
        let Some(manager) = self.manager() else {
            return T::default();
        };

        match panic::catch_unwind(AssertUnwindSafe(|| f(manager.as_ref()))) {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                self.record_failure(err);
                T::default()
            }
            Err(_) => {
                self.record_failure(CacheError::operation_failed(operation, "panic inside cache operation"));
                T::default()
            }
        }
    }

    fn record_failure(&self, err: CacheError) {
        tracing::warn!("OCR cache {} failed: {}", err.operation(), err);
        self.diagnostics.lock().last_error = Some(err.clone());
        if err.kind() == CacheErrorKind::HandleInvalid {
            self.degrade(err);
        }
    }

    /// Ready → Degraded. Releases the handle; later calls stay off the engine.
    fn degrade(&self, err: CacheError) {
        let mut phase = self.phase.lock();
        if let Phase::Ready(manager) = &*phase {
            tracing::warn!("OCR cache degraded after handle invalidation: {}", err);
            manager.close();
            *phase = Phase::Degraded(err);
            self.set_state(CacheState::Degraded);
        }
    }

    /// Store `record` under its key, replacing any earlier record with that key.
    pub fn save_result(&self, record: &ResultRecord) -> bool {
        self.run(Operation::SaveResult, |m| m.save_result(record).map(|_| true))
    }

    /// Every cached record in first-insertion order; empty when unavailable.
    pub fn load_all(&self) -> Vec<ResultRecord> {
        self.run(Operation::LoadAll, |m| m.load_all())
    }

    pub fn save_session(&self, session: &SessionRecord) -> bool {
        self.run(Operation::SaveSession, |m| m.save_session(session).map(|_| true))
    }

    pub fn append_session_page(&self, session_id: &str, page: &ResultRecord) -> bool {
        self.run(Operation::AppendSessionPage, |m| {
            m.append_session_page(session_id, page).map(|_| true)
        })
    }

    /// `None` when the session is absent or the cache is unavailable.
    pub fn load_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.run(Operation::LoadSession, |m| m.load_session(session_id))
    }

    pub fn has_cache(&self, key: &CacheKey) -> bool {
        self.run(Operation::HasCache, |m| m.has_cache(key))
    }

    pub fn has_any_cache(&self) -> bool {
        self.run(Operation::Stats, |m| m.has_any_cache())
    }

    pub fn clear_cache(&self) -> bool {
        self.run(Operation::ClearCache, |m| m.clear_cache().map(|_| true))
    }

    pub fn checkpoint(&self) -> bool {
        self.run(Operation::Checkpoint, |m| m.checkpoint().map(|_| true))
    }

    pub fn stats(&self) -> Option<StoreStats> {
        self.run(Operation::Stats, |m| m.stats().map(Some))
    }

    /// Release the handle. Idempotent; later operations are no-ops and never reopen.
    pub fn close(&self) {
        let mut phase = self.phase.lock();
        if let Phase::Ready(manager) = &*phase {
            manager.close();
        }
        if !matches!(*phase, Phase::Closed) {
            *phase = Phase::Closed;
            self.set_state(CacheState::Closed);
            tracing::debug!("OCR cache wrapper closed");
        }
    }

    /// Snapshot for operators. Never initializes the cache and never fails.
    pub fn health(&self) -> CacheHealth {
        let state = self.state();
        let (loaded, engine_abi, init_error, last_error, recovery) = {
            let diagnostics = self.diagnostics.lock();
            (
                diagnostics.loaded,
                diagnostics.engine_abi,
                diagnostics.init_error.clone(),
                diagnostics.last_error.clone(),
                diagnostics.recovery.clone(),
            )
        };

        let stats = if state == CacheState::Ready {
            self.phase
                .try_lock_for(HEALTH_LOCK_TIMEOUT)
                .and_then(|phase| match &*phase {
                    Phase::Ready(manager) => Some(Arc::clone(manager)),
                    _ => None,
                })
                .and_then(|manager| manager.stats_within(HEALTH_LOCK_TIMEOUT))
        } else {
            None
        };

        CacheHealth::from_inputs(HealthInputs {
            state,
            loaded,
            backend: self.loader.backend().to_string(),
            engine_abi,
            db_path: self.config.resolved_db_path(),
            init_error,
            last_error,
            recovery,
            stats,
        })
    }
}

impl Drop for SafeCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SafeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeCache")
            .field("state", &self.state())
            .field("backend", &self.loader.backend())
            .finish()
    }
}
