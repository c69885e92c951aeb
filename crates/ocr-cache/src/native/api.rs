#![allow(unsafe_code)]

use ocr_cache_engine::{OCR_CACHE_ABI_VERSION, OcrCacheBuffer, OcrCacheHandle};

use crate::error::{CacheError, Operation, Result};

pub type AbiVersionFn = unsafe extern "C" fn() -> u32;
pub type OpenFn = unsafe extern "C" fn(*const u8, usize, u32, *mut OcrCacheHandle, *mut OcrCacheBuffer) -> i32;
pub type HandleFn = unsafe extern "C" fn(OcrCacheHandle) -> i32;
pub type KeyRecordFn = unsafe extern "C" fn(OcrCacheHandle, *const u8, usize, *const u8, usize) -> i32;
pub type BytesFn = unsafe extern "C" fn(OcrCacheHandle, *const u8, usize) -> i32;
pub type ReadFn = unsafe extern "C" fn(OcrCacheHandle, *mut OcrCacheBuffer) -> i32;
pub type ReadByKeyFn = unsafe extern "C" fn(OcrCacheHandle, *const u8, usize, *mut OcrCacheBuffer) -> i32;
pub type ExistsFn = unsafe extern "C" fn(OcrCacheHandle, *const u8, usize, *mut bool) -> i32;
pub type BufferFreeFn = unsafe extern "C" fn(OcrCacheBuffer);

/// Entry points of one engine build.
///
/// Fields are public so tests can substitute individual entry points.
#[derive(Clone, Copy, Debug)]
pub struct NativeApi {
    pub abi_version: AbiVersionFn,
    pub open: OpenFn,
    pub close: HandleFn,
    pub put_result: KeyRecordFn,
    pub get_all_results: ReadFn,
    pub put_session: BytesFn,
    pub append_session_page: KeyRecordFn,
    pub get_session: ReadByKeyFn,
    pub exists: ExistsFn,
    pub clear: HandleFn,
    pub checkpoint: HandleFn,
    pub stats: ReadFn,
    pub last_error: ReadFn,
    pub buffer_free: BufferFreeFn,
}

impl NativeApi {
    /// The engine linked into this binary.
    pub fn linked() -> Self {
        use ocr_cache_engine as engine;

        Self {
            abi_version: engine::ocr_cache_abi_version,
            open: engine::ocr_cache_open,
            close: engine::ocr_cache_close,
            put_result: engine::ocr_cache_put_result,
            get_all_results: engine::ocr_cache_get_all_results,
            put_session: engine::ocr_cache_put_session,
            append_session_page: engine::ocr_cache_append_session_page,
            get_session: engine::ocr_cache_get_session,
            exists: engine::ocr_cache_exists,
            clear: engine::ocr_cache_clear,
            checkpoint: engine::ocr_cache_checkpoint,
            stats: engine::ocr_cache_stats,
            last_error: engine::ocr_cache_last_error,
            buffer_free: engine::ocr_cache_buffer_free,
        }
    }
}

/// Resolves an engine's entry points.
///
/// Loading is separate from opening so that "engine missing" and "store
/// unusable" stay distinguishable.
pub trait EngineLoader: Send + Sync {
    /// Short backend name for diagnostics.
    fn backend(&self) -> &str;

    fn load(&self) -> Result<NativeApi>;
}

/// Statically linked engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedEngine;

impl EngineLoader for LinkedEngine {
    fn backend(&self) -> &str {
        "native"
    }

    fn load(&self) -> Result<NativeApi> {
        Ok(NativeApi::linked())
    }
}

/// No engine; every load fails with `NativeUnavailable`.
#[derive(Debug, Clone)]
pub struct DisabledEngine {
    reason: String,
}

impl DisabledEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl EngineLoader for DisabledEngine {
    fn backend(&self) -> &str {
        "disabled"
    }

    fn load(&self) -> Result<NativeApi> {
        Err(CacheError::native_unavailable(Operation::LoadEngine, self.reason.clone()))
    }
}

impl EngineLoader for NativeApi {
    fn backend(&self) -> &str {
        "custom"
    }

    fn load(&self) -> Result<NativeApi> {
        Ok(*self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadedEngine {
    pub api: NativeApi,
    pub abi_version: u32,
}

/// Load the entry points and check the ABI version before any other call.
pub fn load_engine(loader: &dyn EngineLoader) -> Result<LoadedEngine> {
    let api = loader.load()?;
    // SAFETY: abi_version takes no arguments and touches no caller memory.
    let abi_version = unsafe { (api.abi_version)() };
    if abi_version != OCR_CACHE_ABI_VERSION {
        return Err(CacheError::native_unavailable(
            Operation::LoadEngine,
            format!(
                "engine ABI version {} does not match expected version {}",
                abi_version, OCR_CACHE_ABI_VERSION
            ),
        ));
    }
    tracing::debug!("Loaded {} cache engine (ABI v{})", loader.backend(), abi_version);
    Ok(LoadedEngine { api, abi_version })
}
