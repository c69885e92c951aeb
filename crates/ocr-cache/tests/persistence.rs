//! Round trips through the full stack: wrapper, manager, binding, engine.

use ocr_cache::{CacheErrorKind, CacheKey, ResultRecord, SafeCache, SessionRecord, TextRegion};
use tempfile::tempdir;

mod helpers;
use helpers::*;

/// Test that a saved record is loaded back exactly once.
#[test]
fn test_save_then_load_includes_record_once() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));

    let saved = record("abc", "Invoice 2024-117");
    assert!(cache.save_result(&saved));

    let all = cache.load_all();
    assert_eq!(all.iter().filter(|r| r.key == saved.key).count(), 1);
    assert_eq!(all[0], saved);
    assert!(cache.has_cache(&saved.key));
}

/// Test that saving the same key twice replaces rather than duplicates.
#[test]
fn test_same_key_replaces() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));

    assert!(cache.save_result(&record("first", "one")));
    assert!(cache.save_result(&record("abc", "draft")));
    assert!(cache.save_result(&record("abc", "final")));

    let all = cache.load_all();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].text, "one");
    assert_eq!(all[1].text, "final");
}

/// Test that records survive closing and reopening the database.
#[test]
fn test_records_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let cache = SafeCache::new(temp_config(dir.path()));
        assert!(cache.save_result(&record("abc", "persisted")));
        assert!(cache.save_session(&session("batch", 2)));
    }

    let cache = SafeCache::new(temp_config(dir.path()));
    assert_eq!(cache.load_all()[0].text, "persisted");
    assert_eq!(cache.load_session("batch").unwrap().pages.len(), 2);
}

/// Test that a three-page session loads back with its pages in order.
#[test]
fn test_three_page_session_in_order() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));

    let saved = session("scan-2024-03", 3);
    assert!(cache.save_session(&saved));

    let loaded = cache.load_session("scan-2024-03").unwrap();
    assert_eq!(loaded.id, saved.id);
    assert_eq!(loaded.pages, saved.pages);
    let texts: Vec<_> = loaded.pages.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(texts, vec!["page 1", "page 2", "page 3"]);
}

/// Test that pages appended as they are processed extend the session in order.
#[test]
fn test_appended_pages_extend_session() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));

    let mut started = SessionRecord::new("live");
    started.current_index = 0;
    assert!(cache.save_session(&started));
    for i in 0..3 {
        assert!(cache.append_session_page("live", &record(&format!("p{}", i), &format!("page {}", i + 1))));
    }

    let loaded = cache.load_session("live").unwrap();
    let texts: Vec<_> = loaded.pages.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(texts, vec!["page 1", "page 2", "page 3"]);
    assert!(!cache.append_session_page("never-started", &record("x", "x")));
}

/// Test that saving a session again replaces its pages.
#[test]
fn test_session_resave_replaces_pages() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));

    assert!(cache.save_session(&session("batch", 3)));
    assert!(cache.save_session(&session("batch", 1)));
    assert_eq!(cache.load_session("batch").unwrap().pages.len(), 1);
}

/// Test that clearing removes results and sessions.
#[test]
fn test_clear_removes_everything() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));

    assert!(cache.save_result(&record("abc", "x")));
    assert!(cache.save_session(&session("batch", 2)));
    assert!(cache.has_any_cache());

    assert!(cache.clear_cache());
    assert!(!cache.has_any_cache());
    assert!(cache.load_all().is_empty());
    assert!(cache.load_session("batch").is_none());
    assert!(!cache.has_cache(&CacheKey::new("tesseract", "abc")));
}

/// Test that stats reflect stored content and that the WAL is folded in on close.
#[test]
fn test_stats_and_side_files() {
    let dir = tempdir().unwrap();
    let wal = dir.path().join("ocr_cache.db-wal");
    let cache = SafeCache::new(temp_config(dir.path()));

    assert!(cache.save_result(&record("a", "x")));
    assert!(cache.save_session(&session("batch", 3)));
    let stats = cache.stats().unwrap();
    assert_eq!(stats.results, 1);
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.session_pages, 3);
    assert!(cache.checkpoint());
    assert!(wal.exists());

    cache.close();
    assert!(db_path(dir.path()).exists());
    assert!(!wal.exists());
}

/// Test that deleting the database files is equivalent to clearing.
#[test]
fn test_deleting_files_clears_cache() {
    let dir = tempdir().unwrap();
    {
        let cache = SafeCache::new(temp_config(dir.path()));
        assert!(cache.save_result(&record("abc", "x")));
    }
    std::fs::remove_file(db_path(dir.path())).unwrap();

    let cache = SafeCache::new(temp_config(dir.path()));
    assert!(!cache.has_any_cache());
}

/// Test that a content-derived key finds the record saved under it.
#[test]
fn test_content_key_lookup() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));
    let bytes = b"\x89PNG fake page";

    let key = CacheKey::from_content(bytes, "paddle");
    assert!(!cache.has_cache(&key));
    assert!(cache.save_result(&ResultRecord::new(key.clone(), "cached")));
    assert!(cache.has_cache(&CacheKey::from_content(bytes, "paddle")));
    assert!(!cache.has_cache(&CacheKey::from_content(bytes, "tesseract")));
}

/// Test that keys whose parts contain ':' never share a storage row.
#[test]
fn test_colon_keys_stay_distinct() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));
    let left = CacheKey::new("a:b", "c");
    let right = CacheKey::new("a", "b:c");

    assert!(cache.save_result(&ResultRecord::new(left.clone(), "left")));
    assert!(!cache.has_cache(&right));

    assert!(cache.save_result(&ResultRecord::new(right.clone(), "right")));
    let all = cache.load_all();
    assert_eq!(all.len(), 2);
    assert_eq!((all[0].key.clone(), all[0].text.as_str()), (left, "left"));
    assert_eq!((all[1].key.clone(), all[1].text.as_str()), (right, "right"));
}

/// Test that a record with a NaN coordinate is refused and nothing is stored.
#[test]
fn test_non_finite_region_not_stored() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));
    let bad = record("nan", "x").with_region(TextRegion::new(0.0, 0.0, f64::NAN, 1.0, "bad"));

    assert!(!cache.save_result(&bad));
    assert!(!cache.has_cache(&bad.key));
    assert!(cache.load_all().is_empty());

    let health = cache.health();
    assert!(health.ready);
    assert_eq!(health.error_kind, Some(CacheErrorKind::EncodingError));
}

/// Test that appending a page moves the loaded session's update time forward.
#[test]
fn test_append_advances_updated_at() {
    let dir = tempdir().unwrap();
    let cache = SafeCache::new(temp_config(dir.path()));

    let mut started = SessionRecord::new("live");
    started.created_at = 1_000;
    started.updated_at = 1_000;
    assert!(cache.save_session(&started));
    assert_eq!(cache.load_session("live").unwrap().updated_at, 1_000);

    assert!(cache.append_session_page("live", &record("p0", "page 1")));
    let loaded = cache.load_session("live").unwrap();
    assert_eq!(loaded.created_at, 1_000);
    assert!(loaded.updated_at > 1_000);
    assert_eq!(loaded.pages.len(), 1);
}
