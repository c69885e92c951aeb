//! Status codes returned by every engine entry point.
//!
//! The numeric values are part of the ABI and never change. Callers compare
//! against [`OcrCacheStatus::Ok`] and, on failure, read the handle's last error
//! message for detail.
//!
//! - **Ok (0)**: the call succeeded
//! - **InvalidHandle (1)**: unknown, closed, or poisoned handle
//! - **NullPointer (2)**: a required pointer argument was NULL
//! - **InvalidArgument (3)**: payload rejected (not a JSON object, empty id, ...)
//! - **Encoding (4)**: bytes were not valid UTF-8
//! - **NotFound (5)**: session id unknown
//! - **Storage (6)**: SQLite reported a non-fatal failure
//! - **Unwritable (7)**: database path cannot be created or written
//! - **Locked (8)**: another process holds the database
//! - **SchemaMismatch (9)**: database written by an incompatible engine
//! - **Corrupt (10)**: database damaged beyond automatic repair
//! - **Io (11)**: operating system I/O failure
//! - **Internal (12)**: engine bug (caught panic)

use rusqlite::ErrorCode as SqliteCode;
use thiserror::Error;

#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OcrCacheStatus {
    Ok = 0,
    InvalidHandle = 1,
    NullPointer = 2,
    InvalidArgument = 3,
    Encoding = 4,
    NotFound = 5,
    Storage = 6,
    Unwritable = 7,
    Locked = 8,
    SchemaMismatch = 9,
    Corrupt = 10,
    Io = 11,
    Internal = 12,
}

impl OcrCacheStatus {
    /// Lowercase name used in logs and diagnostics.
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            OcrCacheStatus::Ok => "ok",
            OcrCacheStatus::InvalidHandle => "invalid_handle",
            OcrCacheStatus::NullPointer => "null_pointer",
            OcrCacheStatus::InvalidArgument => "invalid_argument",
            OcrCacheStatus::Encoding => "encoding",
            OcrCacheStatus::NotFound => "not_found",
            OcrCacheStatus::Storage => "storage",
            OcrCacheStatus::Unwritable => "unwritable",
            OcrCacheStatus::Locked => "locked",
            OcrCacheStatus::SchemaMismatch => "schema_mismatch",
            OcrCacheStatus::Corrupt => "corrupt",
            OcrCacheStatus::Io => "io",
            OcrCacheStatus::Internal => "internal",
        }
    }

    /// Converts a raw status back into the enum.
    ///
    /// Returns `None` for values outside the defined range.
    #[inline]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(OcrCacheStatus::Ok),
            1 => Some(OcrCacheStatus::InvalidHandle),
            2 => Some(OcrCacheStatus::NullPointer),
            3 => Some(OcrCacheStatus::InvalidArgument),
            4 => Some(OcrCacheStatus::Encoding),
            5 => Some(OcrCacheStatus::NotFound),
            6 => Some(OcrCacheStatus::Storage),
            7 => Some(OcrCacheStatus::Unwritable),
            8 => Some(OcrCacheStatus::Locked),
            9 => Some(OcrCacheStatus::SchemaMismatch),
            10 => Some(OcrCacheStatus::Corrupt),
            11 => Some(OcrCacheStatus::Io),
            12 => Some(OcrCacheStatus::Internal),
            _ => None,
        }
    }

    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Failures after which the store can no longer be trusted.
    #[inline]
    pub fn is_fatal(self) -> bool {
        matches!(self, OcrCacheStatus::Corrupt | OcrCacheStatus::Io)
    }
}

impl std::fmt::Display for OcrCacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure inside the engine, carried to the ABI as a status plus message.
#[derive(Debug, Clone, Error)]
#[error("{status}: {message}")]
pub struct EngineError {
    pub status: OcrCacheStatus,
    pub message: String,
}

impl EngineError {
    pub fn new<S: Into<String>>(status: OcrCacheStatus, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(OcrCacheStatus::InvalidArgument, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(OcrCacheStatus::NotFound, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(OcrCacheStatus::Internal, message)
    }

    /// Wraps a SQLite failure, prefixing what the engine was doing.
    pub fn sqlite(context: &str, err: &rusqlite::Error) -> Self {
        Self::new(classify_sqlite(err), format!("{}: {}", context, err))
    }

    pub fn io(context: &str, err: &std::io::Error) -> Self {
        let status = match err.kind() {
            std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::ReadOnlyFilesystem
            | std::io::ErrorKind::NotADirectory => OcrCacheStatus::Unwritable,
            _ => OcrCacheStatus::Io,
        };
        Self::new(status, format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub(crate) fn classify_sqlite(err: &rusqlite::Error) -> OcrCacheStatus {
    match err.sqlite_error_code() {
        Some(SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked) => OcrCacheStatus::Locked,
        Some(SqliteCode::NotADatabase | SqliteCode::DatabaseCorrupt) => OcrCacheStatus::Corrupt,
        Some(SqliteCode::PermissionDenied | SqliteCode::ReadOnly | SqliteCode::CannotOpen) => {
            OcrCacheStatus::Unwritable
        }
        Some(SqliteCode::SystemIoFailure) => OcrCacheStatus::Io,
        _ => OcrCacheStatus::Storage,
    }
}
