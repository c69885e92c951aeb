//! SQLite-backed store behind one engine handle.
//!
//! The connection runs in exclusive locking mode with a write-ahead log, so a
//! single process owns the database while the store is open and the `-wal`
//! side file is folded back into the primary file when the store is dropped.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{EngineError, OcrCacheStatus, Result};

pub const SCHEMA_VERSION: u32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);
/// Committed writes between passive checkpoints.
const CHECKPOINT_EVERY: u32 = 64;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS results (
    key BLOB PRIMARY KEY,
    record TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    id BLOB PRIMARY KEY,
    envelope TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS session_pages (
    session_id BLOB NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    page_index INTEGER NOT NULL,
    record TEXT NOT NULL,
    PRIMARY KEY (session_id, page_index)
);
";

/// Flags accepted by `ocr_cache_open`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Back up and recreate a database that recovery could not repair.
    pub rebuild_corrupt: bool,
}

impl OpenOptions {
    pub const REBUILD_CORRUPT: u32 = 1;

    pub fn from_flags(flags: u32) -> Self {
        Self {
            rebuild_corrupt: flags & Self::REBUILD_CORRUPT != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Truncate,
}

impl CheckpointMode {
    fn pragma(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

/// Counters reported by `ocr_cache_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub results: u64,
    pub sessions: u64,
    pub session_pages: u64,
    pub database_bytes: u64,
    pub wal_bytes: u64,
    pub schema_version: u32,
    pub recovered: bool,
}

pub struct Store {
    conn: Connection,
    path: PathBuf,
    writes_since_checkpoint: u32,
    recovered: bool,
}

/// A freshly opened store plus the recovery report, if recovery ran.
pub struct Opened {
    pub store: Store,
    pub recovery: Option<String>,
}

impl Store {
    /// Opens (or creates) the database at `path`, running bounded recovery if
    /// the file turns out to be damaged.
    pub fn open(path: &Path, options: OpenOptions) -> Result<Opened> {
        validate_store_path(path)?;
        ensure_parent_dir(path)?;

        match Self::connect(path) {
            Ok(store) => Ok(Opened { store, recovery: None }),
            Err(err) if err.status == OcrCacheStatus::Corrupt => crate::recovery::recover(path, options, err),
            Err(err) => Err(err),
        }
    }

    /// One connection attempt, no recovery.
    pub(crate) fn connect(path: &Path) -> Result<Store> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| EngineError::sqlite(&format!("opening {}", path.display()), &e))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| EngineError::sqlite("setting busy timeout", &e))?;
        conn.query_row("PRAGMA locking_mode = EXCLUSIVE", [], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::sqlite("acquiring exclusive locking mode", &e))?;

        check_integrity(&conn)?;
        verify_schema(&conn)?;
        enable_wal(&conn)?;
        create_schema(&conn)?;

        Ok(Store {
            conn,
            path: path.to_path_buf(),
            writes_since_checkpoint: 0,
            recovered: false,
        })
    }

    pub(crate) fn mark_recovered(&mut self) {
        self.recovered = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces the record stored under `key`.
    ///
    /// A replaced record keeps its original position in [`Store::all_results`].
    pub fn put_result(&mut self, key: &str, record: &str) -> Result<()> {
        if key.is_empty() {
            return Err(EngineError::invalid_argument("result key cannot be empty"));
        }
        parse_object(record, "record")?;

        let now = now_ms();
        self.conn
            .execute(
                "INSERT INTO results (key, record, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(key) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
                params![key.as_bytes(), record, now],
            )
            .map_err(|e| EngineError::sqlite("storing result", &e))?;

        self.after_write();
        Ok(())
    }

    /// All stored records as one JSON array, in first-insertion order.
    pub fn all_results(&self) -> Result<String> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM results ORDER BY rowid")
            .map_err(|e| EngineError::sqlite("reading results", &e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::sqlite("reading results", &e))?;

        let mut out = String::from("[");
        for (i, row) in rows.enumerate() {
            let record = row.map_err(|e| EngineError::sqlite("reading results", &e))?;
            if i > 0 {
                out.push(',');
            }
            out.push_str(&record);
        }
        out.push(']');
        Ok(out)
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM results WHERE key = ?1)",
                params![key.as_bytes()],
                |row| row.get::<_, i64>(0),
            )
            .map(|found| found != 0)
            .map_err(|e| EngineError::sqlite("checking result", &e))
    }

    /// Replaces the whole session described by `payload`.
    ///
    /// The payload must be a JSON object with a non-empty string `id` and a
    /// `pages` array of objects. Pages are stored in array order; every other
    /// field is kept verbatim as the session envelope.
    pub fn put_session(&mut self, payload: &str) -> Result<()> {
        let mut envelope = parse_object(payload, "session")?;

        let id = match envelope.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(EngineError::invalid_argument("session payload needs a non-empty string 'id'")),
        };
        let pages = match envelope.remove("pages") {
            Some(Value::Array(pages)) => pages,
            _ => {
                return Err(EngineError::invalid_argument(format!(
                    "session '{}' payload needs a 'pages' array",
                    id
                )));
            }
        };
        if let Some(index) = pages.iter().position(|page| !page.is_object()) {
            return Err(EngineError::invalid_argument(format!(
                "session '{}' page {} is not a JSON object",
                id, index
            )));
        }

        let envelope = Value::Object(envelope).to_string();
        let now = now_ms();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| EngineError::sqlite("starting session write", &e))?;
        tx.execute(
            "INSERT INTO sessions (id, envelope, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET envelope = excluded.envelope, updated_at = excluded.updated_at",
            params![id.as_bytes(), envelope, now],
        )
        .map_err(|e| EngineError::sqlite("storing session", &e))?;
        tx.execute("DELETE FROM session_pages WHERE session_id = ?1", params![id.as_bytes()])
            .map_err(|e| EngineError::sqlite("replacing session pages", &e))?;
        {
            let mut insert = tx
                .prepare("INSERT INTO session_pages (session_id, page_index, record) VALUES (?1, ?2, ?3)")
                .map_err(|e| EngineError::sqlite("storing session pages", &e))?;
            for (index, page) in pages.iter().enumerate() {
                insert
                    .execute(params![id.as_bytes(), index as i64, page.to_string()])
                    .map_err(|e| EngineError::sqlite("storing session pages", &e))?;
            }
        }
        tx.commit().map_err(|e| EngineError::sqlite("committing session", &e))?;

        self.after_write();
        Ok(())
    }

    /// Appends one page to an existing session.
    pub fn append_session_page(&mut self, id: &str, record: &str) -> Result<()> {
        parse_object(record, "record")?;
        let now = now_ms();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| EngineError::sqlite("starting page append", &e))?;
        let envelope: Option<String> = tx
            .query_row("SELECT envelope FROM sessions WHERE id = ?1", params![id.as_bytes()], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| EngineError::sqlite("looking up session", &e))?;
        let Some(envelope) = envelope else {
            return Err(EngineError::not_found(format!("session '{}' has not been started", id)));
        };
        let envelope = touch_envelope(&envelope, now);

        let next_index: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(page_index) + 1, 0) FROM session_pages WHERE session_id = ?1",
                params![id.as_bytes()],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::sqlite("numbering session page", &e))?;
        tx.execute(
            "INSERT INTO session_pages (session_id, page_index, record) VALUES (?1, ?2, ?3)",
            params![id.as_bytes(), next_index, record],
        )
        .map_err(|e| EngineError::sqlite("appending session page", &e))?;
        tx.execute(
            "UPDATE sessions SET envelope = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.as_bytes(), envelope, now],
        )
        .map_err(|e| EngineError::sqlite("touching session", &e))?;
        tx.commit().map_err(|e| EngineError::sqlite("committing page append", &e))?;

        self.after_write();
        Ok(())
    }

    /// The session envelope with its pages restored, as JSON.
    pub fn session(&self, id: &str) -> Result<String> {
        let envelope: Option<String> = self
            .conn
            .query_row(
                "SELECT envelope FROM sessions WHERE id = ?1",
                params![id.as_bytes()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EngineError::sqlite("reading session", &e))?;
        let envelope = envelope.ok_or_else(|| EngineError::not_found(format!("session '{}' does not exist", id)))?;

        let mut session: Map<String, Value> = serde_json::from_str(&envelope).map_err(|e| {
            EngineError::new(
                OcrCacheStatus::Storage,
                format!("stored envelope for session '{}' is unreadable: {}", id, e),
            )
        })?;

        let mut stmt = self
            .conn
            .prepare("SELECT record FROM session_pages WHERE session_id = ?1 ORDER BY page_index")
            .map_err(|e| EngineError::sqlite("reading session pages", &e))?;
        let rows = stmt
            .query_map(params![id.as_bytes()], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::sqlite("reading session pages", &e))?;

        let mut pages = Vec::new();
        for row in rows {
            let record = row.map_err(|e| EngineError::sqlite("reading session pages", &e))?;
            let page: Value = serde_json::from_str(&record).map_err(|e| {
                EngineError::new(
                    OcrCacheStatus::Storage,
                    format!("stored page of session '{}' is unreadable: {}", id, e),
                )
            })?;
            pages.push(page);
        }
        session.insert("pages".to_string(), Value::Array(pages));

        Ok(Value::Object(session).to_string())
    }

    /// Removes every result and session, then compacts the file.
    pub fn clear(&mut self) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| EngineError::sqlite("starting clear", &e))?;
        tx.execute_batch("DELETE FROM session_pages; DELETE FROM sessions; DELETE FROM results;")
            .map_err(|e| EngineError::sqlite("clearing cache", &e))?;
        tx.commit().map_err(|e| EngineError::sqlite("committing clear", &e))?;

        self.checkpoint(CheckpointMode::Truncate)?;
        self.conn
            .execute_batch("VACUUM;")
            .map_err(|e| EngineError::sqlite("compacting database", &e))?;
        Ok(())
    }

    pub fn checkpoint(&mut self, mode: CheckpointMode) -> Result<()> {
        self.conn
            .query_row(mode.pragma(), [], |row| {
                let busy: i64 = row.get(0)?;
                let log_frames: i64 = row.get(1)?;
                let checkpointed: i64 = row.get(2)?;
                Ok((busy, log_frames, checkpointed))
            })
            .map_err(|e| EngineError::sqlite("checkpointing write-ahead log", &e))?;
        self.writes_since_checkpoint = 0;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<u64> {
            self.conn
                .query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as u64)
                .map_err(|e| EngineError::sqlite("counting rows", &e))
        };

        Ok(StoreStats {
            results: count("SELECT COUNT(*) FROM results")?,
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            session_pages: count("SELECT COUNT(*) FROM session_pages")?,
            database_bytes: file_len(&self.path),
            wal_bytes: file_len(&wal_path(&self.path)),
            schema_version: SCHEMA_VERSION,
            recovered: self.recovered,
        })
    }

    fn after_write(&mut self) {
        self.writes_since_checkpoint += 1;
        if self.writes_since_checkpoint >= CHECKPOINT_EVERY
            && let Err(e) = self.checkpoint(CheckpointMode::Passive)
        {
            tracing::debug!("Passive checkpoint of {} failed: {}", self.path.display(), e);
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.checkpoint(CheckpointMode::Truncate) {
            tracing::debug!("Final checkpoint of {} failed: {}", self.path.display(), e);
        }
    }
}

fn enable_wal(conn: &Connection) -> Result<()> {
    let mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(|e| EngineError::sqlite("enabling write-ahead log", &e))?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(EngineError::new(
            OcrCacheStatus::Storage,
            format!("write-ahead log unavailable (journal mode is {})", mode),
        ));
    }

    conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")
        .map_err(|e| EngineError::sqlite("applying pragmas", &e))
}

pub(crate) fn check_integrity(conn: &Connection) -> Result<()> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check(1)", [], |row| row.get(0))
        .map_err(|e| EngineError::sqlite("checking integrity", &e))?;
    if verdict.eq_ignore_ascii_case("ok") {
        Ok(())
    } else {
        Err(EngineError::new(
            OcrCacheStatus::Corrupt,
            format!("integrity check failed: {}", verdict),
        ))
    }
}

/// Rejects databases written by another engine version or another program.
fn verify_schema(conn: &Connection) -> Result<()> {
    let has_meta: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'cache_meta'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| EngineError::sqlite("reading schema", &e))?;

    if has_meta == 0 {
        let foreign: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::sqlite("reading schema", &e))?;
        if foreign > 0 {
            return Err(EngineError::new(
                OcrCacheStatus::SchemaMismatch,
                format!("database holds {} unrelated tables and no cache metadata", foreign),
            ));
        }
    } else {
        let stored: Option<String> = conn
            .query_row("SELECT value FROM cache_meta WHERE key = 'schema_version'", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| EngineError::sqlite("reading schema version", &e))?;
        let stored = stored.as_deref().unwrap_or("missing");
        if stored.parse::<u32>().ok() != Some(SCHEMA_VERSION) {
            return Err(EngineError::new(
                OcrCacheStatus::SchemaMismatch,
                format!(
                    "database schema version {} is not supported (engine expects {})",
                    stored, SCHEMA_VERSION
                ),
            ));
        }
    }
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| EngineError::sqlite("creating schema", &e))?;
    // The write also takes the exclusive lock for the lifetime of the connection.
    conn.execute(
        "INSERT INTO cache_meta (key, value) VALUES ('schema_version', ?1), ('last_opened_at', ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION.to_string(), now_ms().to_string()],
    )
    .map_err(|e| EngineError::sqlite("recording schema version", &e))?;
    Ok(())
}

fn parse_object(payload: &str, what: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(EngineError::invalid_argument(format!("{} payload must be a JSON object", what))),
        Err(e) => Err(EngineError::invalid_argument(format!(
            "{} payload is not valid JSON: {}",
            what, e
        ))),
    }
}

/// Moves an envelope's own `updated_at` to `now`; other envelopes are left as stored.
fn touch_envelope(envelope: &str, now: i64) -> String {
    match serde_json::from_str::<Map<String, Value>>(envelope) {
        Ok(mut map) if map.contains_key("updated_at") => {
            map.insert("updated_at".to_string(), Value::from(now));
            Value::Object(map).to_string()
        }
        _ => envelope.to_string(),
    }
}

fn validate_store_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(EngineError::invalid_argument("database path cannot be empty"));
    }
    if path.is_dir() {
        return Err(EngineError::invalid_argument(format!(
            "database path {} is a directory",
            path.display()
        )));
    }
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| {
            EngineError::new(
                OcrCacheStatus::Unwritable,
                format!("cannot create database directory {}: {}", parent.display(), e),
            )
        })?;
    }
    Ok(())
}

/// `<path><suffix>`, preserving non-UTF-8 paths.
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn wal_path(path: &Path) -> PathBuf {
    sibling_path(path, "-wal")
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
