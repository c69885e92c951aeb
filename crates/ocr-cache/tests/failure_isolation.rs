//! A fault in one operation does not affect unrelated operations.

use std::sync::Arc;

use ocr_cache::native::NativeHandle;
use ocr_cache::{CacheErrorKind, CacheKey, CacheState, NativeApi, SafeCache, SessionRecord};
use ocr_cache_engine::OcrCacheStatus;
use tempfile::tempdir;

mod helpers;
use helpers::*;

/// Test that a malformed session leaves has_cache working.
#[test]
fn test_malformed_session_then_has_cache() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));
    assert!(cache.save_result(&record("abc", "text")));

    let malformed = SessionRecord::new("").with_pages(vec![record("p", "page")]);
    assert!(!cache.save_session(&malformed));

    assert!(cache.has_cache(&CacheKey::new("tesseract", "abc")));
    assert_eq!(cache.state(), CacheState::Ready);

    let health = cache.health();
    assert!(health.ready);
    assert_eq!(health.error_kind, Some(CacheErrorKind::OperationFailed));
    assert!(health.last_error.unwrap().contains("save_session"));
}

/// Test that a malformed payload rejected by the engine leaves the handle usable.
#[test]
fn test_engine_rejected_payload_keeps_handle() {
    let dir = tempdir().unwrap();
    let handle = NativeHandle::open(NativeApi::linked(), &db_path(dir.path()), 0).unwrap();

    let err = handle.put_session("batch", r#"{"id":"batch","pages":[1,2,3]}"#).unwrap_err();
    assert_eq!(err.kind(), CacheErrorKind::OperationFailed);
    assert_eq!(err.status(), Some(OcrCacheStatus::InvalidArgument));
    assert!(err.message().contains("page 0"));

    let err = handle.put_result("k", "not json").unwrap_err();
    assert_eq!(err.kind(), CacheErrorKind::OperationFailed);

    assert!(!handle.exists("k").unwrap());
    handle.put_result("k", r#"{"text":"ok"}"#).unwrap();
    assert!(handle.exists("k").unwrap());
}

/// Test that repeated write failures never degrade the wrapper.
#[test]
fn test_failing_writes_do_not_degrade() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::with_loader(temp_config(dir.path()), Arc::new(rejecting_put_api()));

    for i in 0..5 {
        assert!(!cache.save_result(&record(&format!("k{}", i), "text")));
    }
    assert_eq!(cache.state(), CacheState::Ready);

    assert!(cache.save_session(&session("batch", 2)));
    assert_eq!(cache.load_session("batch").unwrap().pages.len(), 2);
    assert!(!cache.has_cache(&CacheKey::new("tesseract", "k0")));
}

/// Test that a missing session is not an error for the caller.
#[test]
fn test_missing_session_is_none_and_not_recorded() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));

    assert!(cache.load_session("nope").is_none());
    assert_eq!(cache.state(), CacheState::Ready);
    assert!(cache.health().last_error.is_none());
}
