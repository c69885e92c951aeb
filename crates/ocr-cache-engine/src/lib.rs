//! Native storage engine for the OCR result cache.
//!
//! Exposes a C ABI over a durable SQLite store. Every entry point:
//!
//! - takes an opaque `uint64_t` handle (`0` is never a valid handle)
//! - takes and returns UTF-8 text as pointer + length, never NUL-terminated
//! - returns an `int32_t` status (see [`OcrCacheStatus`])
//! - never unwinds across the boundary; panics become `Internal`
//!
//! Buffers written to `OcrCacheBuffer *out` parameters belong to the caller
//! and must be released with `ocr_cache_buffer_free` exactly once.
//!
//! # Example (C)
//!
//! ```c
//! uint64_t cache = 0;
//! OcrCacheBuffer err = {0};
//! const char *path = "/tmp/ocr_cache.db";
//! if (ocr_cache_open((const uint8_t *)path, strlen(path), 0, &cache, &err) != 0) {
//!     fprintf(stderr, "%.*s\n", (int)err.len, err.data);
//!     ocr_cache_buffer_free(err);
//!     return;
//! }
//! OcrCacheBuffer all = {0};
//! if (ocr_cache_get_all_results(cache, &all) == 0) {
//!     fwrite(all.data, 1, all.len, stdout);
//!     ocr_cache_buffer_free(all);
//! }
//! ocr_cache_close(cache);
//! ```

pub mod buffer;
pub mod error;
mod recovery;
pub mod registry;
pub mod store;

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

pub use buffer::OcrCacheBuffer;
pub use error::{EngineError, OcrCacheStatus};
pub use registry::{NULL_HANDLE, OcrCacheHandle};
pub use store::{CheckpointMode, OpenOptions, SCHEMA_VERSION, StoreStats};

use buffer::borrow_str;
use error::Result;
use registry::CacheEngine;
use store::Store;

/// Bumped whenever an entry point signature or a status value changes.
pub const OCR_CACHE_ABI_VERSION: u32 = 1;

fn status_of(result: std::thread::Result<Result<()>>) -> (i32, Option<String>) {
    match result {
        Ok(Ok(())) => (OcrCacheStatus::Ok.code(), None),
        Ok(Err(e)) => (e.status.code(), Some(e.message)),
        Err(_) => (
            OcrCacheStatus::Internal.code(),
            Some("internal engine error (panic caught at ABI boundary)".to_string()),
        ),
    }
}

/// Resolves `handle`, runs `f`, and records any failure in the handle's error slot.
fn with_engine(handle: OcrCacheHandle, f: impl FnOnce(&CacheEngine) -> Result<()>) -> i32 {
    let engine = match registry::lookup(handle) {
        Ok(engine) => engine,
        Err(e) => return e.status.code(),
    };
    let (code, message) = status_of(panic::catch_unwind(AssertUnwindSafe(|| f(engine.as_ref()))));
    if message.is_some() {
        engine.record(message);
    }
    code
}

/// # Safety
///
/// `out` must be NULL or valid for a write of one `OcrCacheBuffer`.
unsafe fn write_buffer(out: *mut OcrCacheBuffer, payload: String) -> Result<()> {
    if out.is_null() {
        return Err(EngineError::new(OcrCacheStatus::NullPointer, "out cannot be NULL"));
    }
    // SAFETY: checked non-null above; caller guarantees it is writable.
    unsafe { out.write(OcrCacheBuffer::from_string(payload)) };
    Ok(())
}

/// # Safety
///
/// `out` must be NULL or valid for a write of one `OcrCacheBuffer`.
unsafe fn reset_buffer(out: *mut OcrCacheBuffer) {
    if !out.is_null() {
        // SAFETY: checked non-null above; caller guarantees it is writable.
        unsafe { out.write(OcrCacheBuffer::empty()) };
    }
}

/// ABI version implemented by this library.
///
/// Bindings compare this against the version they were built for before
/// making any other call.
#[unsafe(no_mangle)]
pub extern "C" fn ocr_cache_abi_version() -> u32 {
    OCR_CACHE_ABI_VERSION
}

/// Open (or create) the cache database at `path`.
///
/// `flags` is a bit set; `1` (`REBUILD_CORRUPT`) lets recovery replace a
/// damaged database with an empty one after backing it up.
///
/// On success `*out_handle` receives the handle. If recovery ran, its report is
/// available through `ocr_cache_last_error` until the next call on the handle.
/// On failure `*out_handle` is `0` and `*out_error` receives a message
/// (release it with `ocr_cache_buffer_free`). The returned status tells the
/// failures apart:
///
/// - `UNWRITABLE`: directory cannot be created or file cannot be written
/// - `LOCKED`: another process has the database open
/// - `SCHEMA_MISMATCH`: written by an incompatible engine or another program
/// - `CORRUPT`: damaged and automatic recovery failed
///
/// # Safety
///
/// - `path` must point to `path_len` readable bytes of UTF-8
/// - `out_handle` must be valid for writes
/// - `out_error` must be NULL or valid for writes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_open(
    path: *const u8,
    path_len: usize,
    flags: u32,
    out_handle: *mut OcrCacheHandle,
    out_error: *mut OcrCacheBuffer,
) -> i32 {
    // SAFETY: caller guarantees out_error is NULL or writable.
    unsafe { reset_buffer(out_error) };

    if out_handle.is_null() {
        return OcrCacheStatus::NullPointer.code();
    }
    // SAFETY: checked non-null above.
    unsafe { out_handle.write(NULL_HANDLE) };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<OcrCacheHandle> {
        // SAFETY: caller guarantees path points to path_len bytes.
        let path = unsafe { borrow_str(path, path_len, "path") }?;
        let opened = Store::open(Path::new(path), OpenOptions::from_flags(flags))?;
        tracing::debug!("Opened OCR cache at {}", path);
        Ok(registry::register(CacheEngine::new(opened.store, opened.recovery)))
    }));

    let failure = match outcome {
        Ok(Ok(handle)) => {
            // SAFETY: checked non-null above.
            unsafe { out_handle.write(handle) };
            return OcrCacheStatus::Ok.code();
        }
        Ok(Err(e)) => e,
        Err(_) => EngineError::internal("internal engine error (panic caught at ABI boundary)"),
    };

    if !out_error.is_null() {
        // SAFETY: checked non-null above.
        unsafe { out_error.write(OcrCacheBuffer::from_string(failure.message.clone())) };
    }
    failure.status.code()
}

/// Close a handle, checkpointing the write-ahead log into the primary file.
///
/// Closing an unknown or already-closed handle returns `INVALID_HANDLE` and
/// has no other effect.
#[unsafe(no_mangle)]
pub extern "C" fn ocr_cache_close(handle: OcrCacheHandle) -> i32 {
    let closed = panic::catch_unwind(|| registry::unregister(handle)).unwrap_or(false);
    if closed {
        OcrCacheStatus::Ok.code()
    } else {
        OcrCacheStatus::InvalidHandle.code()
    }
}

/// Store `record` (a JSON object) under `key`, replacing any previous record.
///
/// # Safety
///
/// - `key` must point to `key_len` readable bytes
/// - `record` must point to `record_len` readable bytes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_put_result(
    handle: OcrCacheHandle,
    key: *const u8,
    key_len: usize,
    record: *const u8,
    record_len: usize,
) -> i32 {
    with_engine(handle, |engine| {
        // SAFETY: caller guarantees both pointers cover their lengths.
        let key = unsafe { borrow_str(key, key_len, "key") }?;
        let record = unsafe { borrow_str(record, record_len, "record") }?;
        engine.with_store(|store| store.put_result(key, record))
    })
}

/// Write every stored record, as a JSON array in insertion order, to `*out`.
///
/// # Safety
///
/// `out` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_get_all_results(handle: OcrCacheHandle, out: *mut OcrCacheBuffer) -> i32 {
    // SAFETY: caller guarantees out is NULL or writable.
    unsafe { reset_buffer(out) };
    with_engine(handle, |engine| {
        let all = engine.with_store(|store| store.all_results())?;
        // SAFETY: caller guarantees out is NULL or writable.
        unsafe { write_buffer(out, all) }
    })
}

/// Replace a whole session. `session` is a JSON object with a string `id` and
/// a `pages` array of record objects.
///
/// # Safety
///
/// `session` must point to `session_len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_put_session(
    handle: OcrCacheHandle,
    session: *const u8,
    session_len: usize,
) -> i32 {
    with_engine(handle, |engine| {
        // SAFETY: caller guarantees session covers session_len bytes.
        let session = unsafe { borrow_str(session, session_len, "session") }?;
        engine.with_store(|store| store.put_session(session))
    })
}

/// Append one page to a session started with `ocr_cache_put_session`.
///
/// Returns `NOT_FOUND` if the session does not exist.
///
/// # Safety
///
/// - `id` must point to `id_len` readable bytes
/// - `record` must point to `record_len` readable bytes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_append_session_page(
    handle: OcrCacheHandle,
    id: *const u8,
    id_len: usize,
    record: *const u8,
    record_len: usize,
) -> i32 {
    with_engine(handle, |engine| {
        // SAFETY: caller guarantees both pointers cover their lengths.
        let id = unsafe { borrow_str(id, id_len, "session id") }?;
        let record = unsafe { borrow_str(record, record_len, "record") }?;
        engine.with_store(|store| store.append_session_page(id, record))
    })
}

/// Write the session `id` (envelope plus ordered `pages`) as JSON to `*out`.
///
/// # Safety
///
/// - `id` must point to `id_len` readable bytes
/// - `out` must be valid for writes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_get_session(
    handle: OcrCacheHandle,
    id: *const u8,
    id_len: usize,
    out: *mut OcrCacheBuffer,
) -> i32 {
    // SAFETY: caller guarantees out is NULL or writable.
    unsafe { reset_buffer(out) };
    with_engine(handle, |engine| {
        // SAFETY: caller guarantees id covers id_len bytes.
        let id = unsafe { borrow_str(id, id_len, "session id") }?;
        let session = engine.with_store(|store| store.session(id))?;
        // SAFETY: caller guarantees out is NULL or writable.
        unsafe { write_buffer(out, session) }
    })
}

/// # Safety
///
/// - `key` must point to `key_len` readable bytes
/// - `out_exists` must be valid for writes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_exists(
    handle: OcrCacheHandle,
    key: *const u8,
    key_len: usize,
    out_exists: *mut bool,
) -> i32 {
    with_engine(handle, |engine| {
        if out_exists.is_null() {
            return Err(EngineError::new(OcrCacheStatus::NullPointer, "out_exists cannot be NULL"));
        }
        // SAFETY: caller guarantees key covers key_len bytes.
        let key = unsafe { borrow_str(key, key_len, "key") }?;
        let found = engine.with_store(|store| store.exists(key))?;
        // SAFETY: checked non-null above.
        unsafe { out_exists.write(found) };
        Ok(())
    })
}

/// Delete every result and session and compact the database file.
#[unsafe(no_mangle)]
pub extern "C" fn ocr_cache_clear(handle: OcrCacheHandle) -> i32 {
    with_engine(handle, |engine| engine.with_store(|store| store.clear()))
}

/// Passive write-ahead-log checkpoint.
#[unsafe(no_mangle)]
pub extern "C" fn ocr_cache_checkpoint(handle: OcrCacheHandle) -> i32 {
    with_engine(handle, |engine| {
        engine.with_store(|store| store.checkpoint(CheckpointMode::Passive))
    })
}

/// Write store counters and file sizes as a JSON object to `*out`.
///
/// # Safety
///
/// `out` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_stats(handle: OcrCacheHandle, out: *mut OcrCacheBuffer) -> i32 {
    // SAFETY: caller guarantees out is NULL or writable.
    unsafe { reset_buffer(out) };
    with_engine(handle, |engine| {
        let stats = engine.with_store(|store| store.stats())?;
        let json = serde_json::to_string(&stats)
            .map_err(|e| EngineError::internal(format!("serializing stats: {}", e)))?;
        // SAFETY: caller guarantees out is NULL or writable.
        unsafe { write_buffer(out, json) }
    })
}

/// Copy the handle's last error message to `*out`.
///
/// The message describes the most recent failing call on this handle and is
/// overwritten by the next call. An empty buffer means the last call
/// succeeded. Reading it does not clear it.
///
/// # Safety
///
/// `out` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_last_error(handle: OcrCacheHandle, out: *mut OcrCacheBuffer) -> i32 {
    // SAFETY: caller guarantees out is NULL or writable.
    unsafe { reset_buffer(out) };
    let engine = match registry::lookup(handle) {
        Ok(engine) => engine,
        Err(e) => return e.status.code(),
    };
    let message = engine.last_error().unwrap_or_default();
    // SAFETY: caller guarantees out is NULL or writable.
    match unsafe { write_buffer(out, message) } {
        Ok(()) => OcrCacheStatus::Ok.code(),
        Err(e) => e.status.code(),
    }
}

/// Release a buffer returned by any `ocr_cache_*` call.
///
/// Empty buffers and buffers that are not live (already released, or not
/// allocated by this library) are ignored.
///
/// # Safety
///
/// `buffer` must be passed back unmodified.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ocr_cache_buffer_free(buffer: OcrCacheBuffer) {
    // SAFETY: caller passes the buffer back unmodified, so len matches the allocation.
    if !unsafe { buffer.release() } {
        tracing::warn!("Ignored release of a buffer that is not live");
    }
}

/// Number of open handles in this process.
#[unsafe(no_mangle)]
pub extern "C" fn ocr_cache_live_handles() -> usize {
    registry::live_handle_count()
}

/// Number of buffers handed out and not yet released.
#[unsafe(no_mangle)]
pub extern "C" fn ocr_cache_live_buffers() -> usize {
    buffer::live_buffer_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(path: &str) -> OcrCacheHandle {
        let mut handle = NULL_HANDLE;
        let mut err = OcrCacheBuffer::empty();
        let status = unsafe { ocr_cache_open(path.as_ptr(), path.len(), 0, &mut handle, &mut err) };
        assert_eq!(status, 0);
        assert!(err.is_empty());
        handle
    }

    fn take(buffer: OcrCacheBuffer) -> String {
        let text = if buffer.is_empty() {
            String::new()
        } else {
            let bytes = unsafe { std::slice::from_raw_parts(buffer.data, buffer.len) };
            String::from_utf8(bytes.to_vec()).unwrap()
        };
        unsafe { ocr_cache_buffer_free(buffer) };
        text
    }

    #[test]
    fn test_abi_version() {
        assert_eq!(ocr_cache_abi_version(), OCR_CACHE_ABI_VERSION);
    }

    #[test]
    fn test_put_and_read_back_through_abi() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ocr_cache.db");
        let handle = open(path.to_str().unwrap());

        let key = "tess:ab\0cd";
        let record = r#"{"text":"Grüße 你好"}"#;
        let status = unsafe { ocr_cache_put_result(handle, key.as_ptr(), key.len(), record.as_ptr(), record.len()) };
        assert_eq!(status, 0);

        let mut exists = false;
        let status = unsafe { ocr_cache_exists(handle, key.as_ptr(), key.len(), &mut exists) };
        assert_eq!(status, 0);
        assert!(exists);

        let mut out = OcrCacheBuffer::empty();
        assert_eq!(unsafe { ocr_cache_get_all_results(handle, &mut out) }, 0);
        assert_eq!(take(out), format!("[{}]", record));

        assert_eq!(ocr_cache_close(handle), 0);
        assert_eq!(ocr_cache_close(handle), OcrCacheStatus::InvalidHandle.code());
    }

    #[test]
    fn test_failure_sets_last_error_until_next_call() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ocr_cache.db");
        let handle = open(path.to_str().unwrap());

        let bad = "{\"id\":\"s\"}";
        let status = unsafe { ocr_cache_put_session(handle, bad.as_ptr(), bad.len()) };
        assert_eq!(status, OcrCacheStatus::InvalidArgument.code());

        let mut out = OcrCacheBuffer::empty();
        assert_eq!(unsafe { ocr_cache_last_error(handle, &mut out) }, 0);
        assert!(take(out).contains("'pages' array"));

        assert_eq!(ocr_cache_checkpoint(handle), 0);
        let mut out = OcrCacheBuffer::empty();
        assert_eq!(unsafe { ocr_cache_last_error(handle, &mut out) }, 0);
        assert_eq!(take(out), "");

        assert_eq!(ocr_cache_close(handle), 0);
    }

    #[test]
    fn test_invalid_utf8_key_is_encoding_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ocr_cache.db");
        let handle = open(path.to_str().unwrap());

        let key = [0xc3u8, 0x28];
        let record = b"{}";
        let status = unsafe { ocr_cache_put_result(handle, key.as_ptr(), key.len(), record.as_ptr(), record.len()) };
        assert_eq!(status, OcrCacheStatus::Encoding.code());

        assert_eq!(ocr_cache_close(handle), 0);
    }

    #[test]
    fn test_open_failure_reports_message() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let path = blocker.join("ocr_cache.db");
        let path = path.to_str().unwrap();

        let mut handle = 42;
        let mut err = OcrCacheBuffer::empty();
        let status = unsafe { ocr_cache_open(path.as_ptr(), path.len(), 0, &mut handle, &mut err) };
        assert_eq!(status, OcrCacheStatus::Unwritable.code());
        assert_eq!(handle, NULL_HANDLE);
        assert!(take(err).contains("cannot create database directory"));
    }

    #[test]
    fn test_calls_on_unknown_handle_are_rejected() {
        let mut out = OcrCacheBuffer::empty();
        assert_eq!(
            unsafe { ocr_cache_get_all_results(9_999_999, &mut out) },
            OcrCacheStatus::InvalidHandle.code()
        );
        assert!(out.is_empty());
        assert_eq!(ocr_cache_clear(NULL_HANDLE), OcrCacheStatus::InvalidHandle.code());
    }
}
