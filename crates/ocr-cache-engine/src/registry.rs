//! Handle table mapping opaque tokens to open engines.
//!
//! Handles are non-zero `u64` tokens, never pointers. Looking up a token that
//! was never issued, or was already closed, yields `InvalidHandle` instead of
//! touching freed memory. Each lookup clones an `Arc`, so a close racing with
//! an in-flight call only drops the store once that call finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{EngineError, OcrCacheStatus, Result};
use crate::store::Store;

/// Opaque handle value. `0` is reserved as the null sentinel.
pub type OcrCacheHandle = u64;

pub const NULL_HANDLE: OcrCacheHandle = 0;

static ENGINES: Lazy<Mutex<AHashMap<OcrCacheHandle, Arc<CacheEngine>>>> = Lazy::new(|| Mutex::new(AHashMap::new()));
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// One open store plus its single-slot error message.
pub struct CacheEngine {
    store: Mutex<Store>,
    last_error: Mutex<Option<String>>,
    poisoned: AtomicBool,
}

impl CacheEngine {
    pub(crate) fn new(store: Store, note: Option<String>) -> Self {
        Self {
            store: Mutex::new(store),
            last_error: Mutex::new(note),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Runs `f` against the store with the writer lock held.
    ///
    /// The error slot is overwritten on every call: cleared on success, set on
    /// failure. A fatal storage status poisons the engine for all later calls.
    pub(crate) fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> Result<T>) -> Result<T> {
        if self.poisoned.load(Ordering::Acquire) {
            let err = EngineError::new(
                OcrCacheStatus::InvalidHandle,
                "handle invalidated by an earlier unrecoverable storage fault",
            );
            self.record(Some(err.message.clone()));
            return Err(err);
        }

        let result = {
            let mut store = self.store.lock();
            f(&mut store)
        };

        match &result {
            Ok(_) => self.record(None),
            Err(err) => {
                if err.status.is_fatal() {
                    self.poisoned.store(true, Ordering::Release);
                    tracing::warn!("Cache engine poisoned: {}", err);
                }
                self.record(Some(err.message.clone()));
            }
        }
        result
    }

    pub(crate) fn record(&self, message: Option<String>) {
        *self.last_error.lock() = message;
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

pub(crate) fn register(engine: CacheEngine) -> OcrCacheHandle {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    ENGINES.lock().insert(handle, Arc::new(engine));
    handle
}

pub(crate) fn lookup(handle: OcrCacheHandle) -> Result<Arc<CacheEngine>> {
    if handle == NULL_HANDLE {
        return Err(EngineError::new(OcrCacheStatus::InvalidHandle, "handle cannot be NULL"));
    }
    ENGINES.lock().get(&handle).cloned().ok_or_else(|| {
        EngineError::new(
            OcrCacheStatus::InvalidHandle,
            format!("handle {} is not open", handle),
        )
    })
}

/// Removes the handle; the store closes when the last in-flight call drops its `Arc`.
pub(crate) fn unregister(handle: OcrCacheHandle) -> bool {
    ENGINES.lock().remove(&handle).is_some()
}

pub(crate) fn live_handle_count() -> usize {
    ENGINES.lock().len()
}
