//! Bounded repair of a database that failed to open as corrupt.
//!
//! Each step runs at most once, in order:
//!
//! 1. move a leftover `-wal` side file aside and reopen
//! 2. `REINDEX` and re-run the integrity check, then reopen
//! 3. with [`OpenOptions::rebuild_corrupt`], back the damaged file up to
//!    `<db>.corrupt-<unix-ms>` and start an empty store
//!
//! Every step is recorded in a report. When a step succeeds the report becomes
//! the handle's last error; when all steps fail it becomes the open error.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::error::{EngineError, OcrCacheStatus, Result};
use crate::store::{Opened, OpenOptions, Store, check_integrity, now_ms, sibling_path, wal_path};

struct RecoveryReport {
    cause: String,
    steps: Vec<String>,
}

impl RecoveryReport {
    fn new(cause: &EngineError) -> Self {
        Self {
            cause: cause.message.clone(),
            steps: Vec::new(),
        }
    }

    fn step(&mut self, outcome: impl Into<String>) {
        self.steps.push(outcome.into());
    }

    fn render(&self, verdict: &str) -> String {
        format!("{} ({}; recovery: {})", verdict, self.cause, self.steps.join("; "))
    }
}

pub(crate) fn recover(path: &Path, options: OpenOptions, cause: EngineError) -> Result<Opened> {
    tracing::warn!("Cache database {} is damaged, attempting recovery: {}", path.display(), cause);
    let mut report = RecoveryReport::new(&cause);

    let wal = wal_path(path);
    if wal.exists() {
        let aside = sibling_path(path, &format!("-wal.discarded-{}", now_ms()));
        match fs::rename(&wal, &aside) {
            Ok(()) => {
                report.step(format!("moved write-ahead log aside to {}", aside.display()));
                if let Some(opened) = reopen(path, &mut report)? {
                    return Ok(opened);
                }
            }
            Err(e) => report.step(format!("could not move write-ahead log aside: {}", e)),
        }
    } else {
        report.step("no write-ahead log to discard");
    }

    match reindex(path) {
        Ok(()) => {
            report.step("rebuilt indexes");
            if let Some(opened) = reopen(path, &mut report)? {
                return Ok(opened);
            }
        }
        Err(e) => report.step(format!("index rebuild failed: {}", e.message)),
    }

    if options.rebuild_corrupt {
        let backup = backup_database(path).map_err(|e| {
            report.step(format!("backup failed: {}", e.message));
            EngineError::new(OcrCacheStatus::Corrupt, report.render("database is corrupt"))
        })?;
        report.step(format!("backed up damaged database to {}", backup.display()));
        if let Some(opened) = reopen(path, &mut report)? {
            return Ok(opened);
        }
    } else {
        report.step("rebuild not requested");
    }

    let message = report.render("database is corrupt");
    tracing::warn!("Cache database recovery failed: {}", message);
    Err(EngineError::new(OcrCacheStatus::Corrupt, message))
}

/// Retries the open. `Ok(None)` means still corrupt; other failures abort recovery.
fn reopen(path: &Path, report: &mut RecoveryReport) -> Result<Option<Opened>> {
    match Store::connect(path) {
        Ok(mut store) => {
            store.mark_recovered();
            report.step("reopened");
            let message = report.render("database recovered");
            tracing::warn!("{}", message);
            Ok(Some(Opened {
                store,
                recovery: Some(message),
            }))
        }
        Err(e) if e.status == OcrCacheStatus::Corrupt => {
            report.step(format!("reopen failed: {}", e.message));
            Ok(None)
        }
        Err(e) => {
            report.step(format!("reopen failed: {}", e.message));
            Err(EngineError::new(e.status, report.render("database recovery aborted")))
        }
    }
}

fn reindex(path: &Path) -> Result<()> {
    let conn = Connection::open(path).map_err(|e| EngineError::sqlite("opening for reindex", &e))?;
    conn.execute_batch("REINDEX;")
        .map_err(|e| EngineError::sqlite("reindexing", &e))?;
    check_integrity(&conn)
}

/// Moves the damaged file (and any side files) out of the way.
pub(crate) fn backup_database(path: &Path) -> Result<PathBuf> {
    let backup = sibling_path(path, &format!(".corrupt-{}", now_ms()));
    fs::rename(path, &backup).map_err(|e| EngineError::io("backing up damaged database", &e))?;
    for suffix in ["-wal", "-shm", "-journal"] {
        let side = sibling_path(path, suffix);
        if side.exists()
            && let Err(e) = fs::remove_file(&side)
        {
            tracing::debug!("Could not remove {}: {}", side.display(), e);
        }
    }
    Ok(backup)
}
