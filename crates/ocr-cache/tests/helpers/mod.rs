//! Shared fixtures: temporary configs, sample records, and fake engine tables.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ocr_cache::{CacheConfig, CacheKey, NativeApi, ResultRecord, SessionRecord, TextRegion};
use ocr_cache_engine::{OCR_CACHE_ABI_VERSION, OcrCacheBuffer, OcrCacheHandle, OcrCacheStatus};

pub const GARBAGE: &[u8] = b"This is not a valid SQLite database file! It is plain text, padded out to look like a header.";

pub fn db_path(dir: &Path) -> PathBuf {
    dir.join("ocr_cache.db")
}

pub fn temp_config(dir: &Path) -> CacheConfig {
    CacheConfig::with_db_path(db_path(dir))
}

/// A config whose database file exists but is not a database.
pub fn corrupt_config(dir: &Path) -> CacheConfig {
    let path = db_path(dir);
    std::fs::write(&path, GARBAGE).unwrap();
    CacheConfig::with_db_path(path)
}

/// A config whose database directory cannot be created (its parent is a file).
pub fn unwritable_config(dir: &Path) -> CacheConfig {
    let blocker = dir.join("blocker");
    std::fs::write(&blocker, b"file").unwrap();
    CacheConfig::with_db_path(blocker.join("cache").join("ocr_cache.db"))
}

pub fn record(fingerprint: &str, text: &str) -> ResultRecord {
    ResultRecord::new(CacheKey::new("tesseract", fingerprint), text)
        .with_source_path(format!("/scans/{}.png", fingerprint))
        .with_region(TextRegion::new(10.0, 12.0, 180.0, 40.0, text))
}

pub fn session(id: &str, pages: usize) -> SessionRecord {
    let pages = (0..pages)
        .map(|i| record(&format!("{}-{}", id, i), &format!("page {}", i + 1)))
        .collect();
    SessionRecord::new(id).with_pages(pages)
}

pub fn live_native_resources() -> (usize, usize) {
    (
        ocr_cache_engine::ocr_cache_live_handles(),
        ocr_cache_engine::ocr_cache_live_buffers(),
    )
}

pub static OPEN_CALLS: AtomicUsize = AtomicUsize::new(0);

pub fn open_calls() -> usize {
    OPEN_CALLS.load(Ordering::SeqCst)
}

/// Counts opens and lingers so concurrent initializers overlap.
pub unsafe extern "C" fn counting_open(
    path: *const u8,
    path_len: usize,
    flags: u32,
    out_handle: *mut OcrCacheHandle,
    out_error: *mut OcrCacheBuffer,
) -> i32 {
    OPEN_CALLS.fetch_add(1, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(25));
    // SAFETY: arguments are forwarded unchanged from the caller.
    unsafe { ocr_cache_engine::ocr_cache_open(path, path_len, flags, out_handle, out_error) }
}

pub fn counting_api() -> NativeApi {
    NativeApi {
        open: counting_open,
        ..NativeApi::linked()
    }
}

unsafe extern "C" fn newer_abi() -> u32 {
    OCR_CACHE_ABI_VERSION + 1
}

pub fn mismatched_api() -> NativeApi {
    NativeApi {
        abi_version: newer_abi,
        ..NativeApi::linked()
    }
}

/// Opens for real, then reports failure: a handle acquired during a failed init.
unsafe extern "C" fn open_then_fail(
    path: *const u8,
    path_len: usize,
    flags: u32,
    out_handle: *mut OcrCacheHandle,
    out_error: *mut OcrCacheBuffer,
) -> i32 {
    // SAFETY: arguments are forwarded unchanged from the caller.
    let code = unsafe { ocr_cache_engine::ocr_cache_open(path, path_len, flags, out_handle, out_error) };
    if code != OcrCacheStatus::Ok.code() {
        return code;
    }
    OcrCacheStatus::Io.code()
}

pub fn partial_open_api() -> NativeApi {
    NativeApi {
        open: open_then_fail,
        ..NativeApi::linked()
    }
}

unsafe extern "C" fn corrupt_checkpoint(_handle: OcrCacheHandle) -> i32 {
    OcrCacheStatus::Corrupt.code()
}

/// Every checkpoint reports the store as corrupt.
pub fn corrupting_checkpoint_api() -> NativeApi {
    NativeApi {
        checkpoint: corrupt_checkpoint,
        ..NativeApi::linked()
    }
}

unsafe extern "C" fn invalid_argument_put(
    _handle: OcrCacheHandle,
    _key: *const u8,
    _key_len: usize,
    _record: *const u8,
    _record_len: usize,
) -> i32 {
    OcrCacheStatus::InvalidArgument.code()
}

/// Every result write fails on its own without invalidating the handle.
pub fn rejecting_put_api() -> NativeApi {
    NativeApi {
        put_result: invalid_argument_put,
        ..NativeApi::linked()
    }
}
