//! Typed façade over one native handle.
//!
//! A `CacheManager` attempts `open` once, in its constructor. A failed open is
//! captured rather than raised: the manager is then "never initialized" and
//! every operation returns that failure without touching the engine. The
//! handle sits behind a mutex, so each binding call and its error-slot read
//! happen before any other call on the handle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheErrorKind, Operation, Result};
use crate::native::{NativeApi, NativeHandle};
use crate::types::{CacheKey, RecordError, ResultRecord, SessionRecord, StoreStats};

enum Slot {
    Open(NativeHandle),
    NeverInitialized(CacheError),
    Invalidated(CacheError),
    Closed,
}

pub struct CacheManager {
    db_path: PathBuf,
    slot: Mutex<Slot>,
    recovery_note: Option<String>,
    last_error: Mutex<Option<CacheError>>,
}

impl CacheManager {
    pub fn open(api: NativeApi, config: &CacheConfig) -> Self {
        let db_path = config.resolved_db_path();
        let (slot, recovery_note) = match NativeHandle::open(api, &db_path, config.open_flags()) {
            Ok(handle) => {
                let note = handle.last_error();
                if let Some(note) = &note {
                    tracing::warn!("OCR cache at {} was repaired on open: {}", db_path.display(), note);
                }
                tracing::info!("OCR cache opened at {}", db_path.display());
                (Slot::Open(handle), note)
            }
            Err(err) => {
                tracing::warn!("OCR cache at {} could not be opened: {}", db_path.display(), err);
                (Slot::NeverInitialized(err), None)
            }
        };

        Self {
            db_path,
            slot: Mutex::new(slot),
            recovery_note,
            last_error: Mutex::new(None),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Open(_))
    }

    /// The open failure, if construction never produced a handle.
    pub fn init_error(&self) -> Option<CacheError> {
        match &*self.slot.lock() {
            Slot::NeverInitialized(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<CacheError> {
        self.last_error.lock().clone()
    }

    /// Report left by the engine when it repaired the database during open.
    pub fn recovery_note(&self) -> Option<&str> {
        self.recovery_note.as_deref()
    }

    fn with_handle<T>(&self, operation: Operation, f: impl FnOnce(&NativeHandle) -> Result<T>) -> Result<T> {
        let result = {
            let mut slot = self.slot.lock();
            let result = match &*slot {
                Slot::Open(handle) => f(handle),
                Slot::NeverInitialized(err) => Err(err.replay(operation)),
                Slot::Invalidated(err) => Err(CacheError::handle_invalid(
                    operation,
                    format!("handle was invalidated earlier: {}", err.message()),
                )),
                Slot::Closed => Err(CacheError::handle_invalid(operation, "cache manager is closed")),
            };
            if let Err(err) = &result
                && err.kind() == CacheErrorKind::HandleInvalid
                && matches!(*slot, Slot::Open(_))
            {
                tracing::warn!("OCR cache handle invalidated during {}: {}", operation, err);
                // Dropping the handle closes it.
                *slot = Slot::Invalidated(err.clone());
            }
            result
        };

        if let Err(err) = &result {
            *self.last_error.lock() = Some(err.clone());
        }
        result
    }

    /// Records a failure caught before the engine was called.
    fn rejected(&self, err: CacheError) -> CacheError {
        *self.last_error.lock() = Some(err.clone());
        err
    }

    pub fn save_result(&self, record: &ResultRecord) -> Result<()> {
        let key = record.key.as_storage_key();
        record.validate().map_err(|e| {
            self.rejected(invalid_record(Operation::SaveResult, e).with_context(format!("key {}", record.key)))
        })?;
        let json = encode(Operation::SaveResult, record)?;
        self.with_handle(Operation::SaveResult, |handle| handle.put_result(&key, &json))
    }

    /// All stored records in first-insertion order.
    ///
    /// Records that no longer decode are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<ResultRecord>> {
        let json = self.with_handle(Operation::LoadAll, |handle| handle.get_all_results())?;
        let values: Vec<serde_json::Value> = serde_json::from_str(&json)
            .map_err(|e| CacheError::encoding_error(Operation::LoadAll, format!("engine returned invalid JSON: {}", e)))?;

        let mut records = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<ResultRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping cached record that does not decode: {}", e),
            }
        }
        Ok(records)
    }

    pub fn save_session(&self, session: &SessionRecord) -> Result<()> {
        session.validate().map_err(|e| {
            self.rejected(invalid_record(Operation::SaveSession, e).with_context(format!("session {}", session.id)))
        })?;
        let json = encode(Operation::SaveSession, session)?;
        self.with_handle(Operation::SaveSession, |handle| handle.put_session(&session.id, &json))
    }

    pub fn append_session_page(&self, session_id: &str, page: &ResultRecord) -> Result<()> {
        page.validate().map_err(|e| {
            self.rejected(
                invalid_record(Operation::AppendSessionPage, e).with_context(format!("session {}", session_id)),
            )
        })?;
        let json = encode(Operation::AppendSessionPage, page)?;
        self.with_handle(Operation::AppendSessionPage, |handle| {
            handle.append_session_page(session_id, &json)
        })
    }

    pub fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let json = self.with_handle(Operation::LoadSession, |handle| handle.get_session(session_id))?;
        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                CacheError::encoding_error(Operation::LoadSession, format!("stored session does not decode: {}", e))
                    .with_context(format!("session {}", session_id))
            })
        })
        .transpose()
    }

    pub fn has_cache(&self, key: &CacheKey) -> Result<bool> {
        let key = key.as_storage_key();
        self.with_handle(Operation::HasCache, |handle| handle.exists(&key))
    }

    /// Whether anything at all is cached.
    pub fn has_any_cache(&self) -> Result<bool> {
        self.stats().map(|stats| !stats.is_empty())
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.with_handle(Operation::ClearCache, |handle| handle.clear())?;
        tracing::info!("OCR cache cleared at {}", self.db_path.display());
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.with_handle(Operation::Checkpoint, |handle| handle.checkpoint())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let json = self.with_handle(Operation::Stats, |handle| handle.stats())?;
        serde_json::from_str(&json)
            .map_err(|e| CacheError::encoding_error(Operation::Stats, format!("engine returned invalid stats: {}", e)))
    }

    /// Stats without waiting longer than `timeout` for an in-flight call.
    ///
    /// Failures are not recorded; this backs health snapshots only.
    pub fn stats_within(&self, timeout: Duration) -> Option<StoreStats> {
        let slot = self.slot.try_lock_for(timeout)?;
        let Slot::Open(handle) = &*slot else {
            return None;
        };
        handle.stats().ok().and_then(|json| serde_json::from_str(&json).ok())
    }

    /// Releases the handle. Idempotent; a never-initialized manager stays as it is.
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        if let Slot::Open(_) | Slot::Invalidated(_) = &*slot {
            *slot = Slot::Closed;
            tracing::debug!("OCR cache closed at {}", self.db_path.display());
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("db_path", &self.db_path)
            .field("open", &self.is_open())
            .finish()
    }
}

fn invalid_record(operation: Operation, err: RecordError) -> CacheError {
    match err {
        RecordError::Invalid(msg) => CacheError::operation_failed(operation, msg),
        RecordError::Unrepresentable(msg) => CacheError::encoding_error(operation, msg),
    }
}

fn encode<T: serde::Serialize>(operation: Operation, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CacheError::encoding_error(operation, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextRegion;
    use ocr_cache_engine::OcrCacheStatus;
    use std::fs;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> CacheManager {
        CacheManager::open(NativeApi::linked(), &CacheConfig::with_db_path(dir.join("ocr_cache.db")))
    }

    fn record(fingerprint: &str, text: &str) -> ResultRecord {
        ResultRecord::new(CacheKey::new("tesseract", fingerprint), text)
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.is_open());

        manager.save_result(&record("a", "first")).unwrap();
        manager.save_result(&record("b", "second")).unwrap();
        manager.save_result(&record("a", "first, again")).unwrap();

        let texts: Vec<_> = manager.load_all().unwrap().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["first, again", "second"]);
        assert!(manager.has_cache(&CacheKey::new("tesseract", "a")).unwrap());
        assert!(manager.has_any_cache().unwrap());
    }

    #[test]
    fn test_never_initialized_replays_open_failure() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("ocr_cache.db");
        fs::write(&db, b"This is not a valid SQLite database file!").unwrap();

        let manager = CacheManager::open(NativeApi::linked(), &CacheConfig::with_db_path(&db));
        assert!(!manager.is_open());
        assert!(manager.init_error().is_some());

        let err = manager.load_all().unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::OpenFailed);
        assert_eq!(err.operation(), Operation::LoadAll);
        assert_eq!(manager.last_error().unwrap().operation(), Operation::LoadAll);
    }

    #[test]
    fn test_invalid_record_rejected_before_engine() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let err = manager.save_result(&record("", "x")).unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::OperationFailed);
        assert_eq!(manager.last_error().unwrap().operation(), Operation::SaveResult);
        assert!(manager.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_non_finite_region_is_encoding_error() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        let bad = record("n", "x").with_region(TextRegion::new(0.0, 0.0, f64::NAN, 1.0, "bad"));

        let err = manager.save_result(&bad).unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::EncodingError);
        assert!(err.message().contains("non-finite"));

        let session = SessionRecord::new("batch").with_pages(vec![bad.clone()]);
        let err = manager.save_session(&session).unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::EncodingError);
        assert!(err.message().starts_with("page 0"));

        assert!(manager.is_open());
        assert!(!manager.has_any_cache().unwrap());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager.close();
        manager.close();

        let err = manager.has_cache(&CacheKey::new("tesseract", "a")).unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::HandleInvalid);
    }

    #[test]
    fn test_clear_empties_store() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager.save_result(&record("a", "x")).unwrap();
        manager.clear_cache().unwrap();
        assert!(!manager.has_any_cache().unwrap());
    }

    #[test]
    fn test_session_append_and_load() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let session = SessionRecord::new("batch").with_pages(vec![record("1", "one")]);
        manager.save_session(&session).unwrap();
        manager.append_session_page("batch", &record("2", "two")).unwrap();

        let loaded = manager.load_session("batch").unwrap().unwrap();
        let texts: Vec<_> = loaded.pages.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(manager.load_session("other").unwrap(), None);
    }

    #[test]
    fn test_append_to_missing_session_fails_alone() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());

        let err = manager.append_session_page("ghost", &record("1", "one")).unwrap_err();
        assert_eq!(err.kind(), CacheErrorKind::OperationFailed);
        assert_eq!(err.status(), Some(OcrCacheStatus::NotFound));
        assert!(manager.is_open());
    }
}
