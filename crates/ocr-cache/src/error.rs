//! Error taxonomy for the cache.
//!
//! Every failure below the safety wrapper becomes a [`CacheError`] carrying:
//!
//! - a [`CacheErrorKind`], one of five classes
//! - the [`Operation`] that failed
//! - optional context (the key or session id involved)
//! - the engine's own message and status code, when the engine produced one
//!
//! # Kinds
//!
//! - `NativeUnavailable` - the engine could not be loaded at all (disabled,
//!   ABI mismatch). Distinct from `OpenFailed` so diagnostics can tell
//!   "engine missing" from "store unusable".
//! - `OpenFailed` - the engine is present but the database could not be
//!   opened; [`OpenFailure`] says why.
//! - `OperationFailed` - one call failed; the handle stays usable.
//! - `HandleInvalid` - call after close, or after the engine reported the
//!   handle unusable.
//! - `EncodingError` - a payload could not be represented at the boundary.
//!
//! The safety wrapper never surfaces these to callers; they are recorded and
//! reported through [`crate::SafeCache::health`].

use std::fmt;

use ocr_cache_engine::OcrCacheStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheErrorKind {
    NativeUnavailable,
    OpenFailed,
    OperationFailed,
    HandleInvalid,
    EncodingError,
}

impl CacheErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheErrorKind::NativeUnavailable => "native engine unavailable",
            CacheErrorKind::OpenFailed => "open failed",
            CacheErrorKind::OperationFailed => "operation failed",
            CacheErrorKind::HandleInvalid => "handle invalid",
            CacheErrorKind::EncodingError => "encoding error",
        }
    }

    /// Kinds that make the wrapper give up on the engine for its lifetime.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CacheErrorKind::NativeUnavailable | CacheErrorKind::OpenFailed | CacheErrorKind::HandleInvalid
        )
    }
}

impl fmt::Display for CacheErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an open failed, derived from the engine's status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenFailure {
    Unwritable,
    Locked,
    SchemaMismatch,
    Corrupt,
    InvalidPath,
    Io,
    Other,
}

impl OpenFailure {
    pub fn from_status(status: Option<OcrCacheStatus>) -> Self {
        match status {
            Some(OcrCacheStatus::Unwritable) => OpenFailure::Unwritable,
            Some(OcrCacheStatus::Locked) => OpenFailure::Locked,
            Some(OcrCacheStatus::SchemaMismatch) => OpenFailure::SchemaMismatch,
            Some(OcrCacheStatus::Corrupt) => OpenFailure::Corrupt,
            Some(OcrCacheStatus::InvalidArgument | OcrCacheStatus::Encoding | OcrCacheStatus::NullPointer) => {
                OpenFailure::InvalidPath
            }
            Some(OcrCacheStatus::Io) => OpenFailure::Io,
            _ => OpenFailure::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpenFailure::Unwritable => "path unwritable",
            OpenFailure::Locked => "database locked by another process",
            OpenFailure::SchemaMismatch => "schema version mismatch",
            OpenFailure::Corrupt => "corrupt database file",
            OpenFailure::InvalidPath => "invalid database path",
            OpenFailure::Io => "I/O failure",
            OpenFailure::Other => "unclassified open failure",
        }
    }
}

impl fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The call a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    LoadEngine,
    Open,
    SaveResult,
    LoadAll,
    SaveSession,
    AppendSessionPage,
    LoadSession,
    HasCache,
    ClearCache,
    Checkpoint,
    Stats,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::LoadEngine => "load_engine",
            Operation::Open => "open",
            Operation::SaveResult => "save_result",
            Operation::LoadAll => "load_all",
            Operation::SaveSession => "save_session",
            Operation::AppendSessionPage => "append_session_page",
            Operation::LoadSession => "load_session",
            Operation::HasCache => "has_cache",
            Operation::ClearCache => "clear_cache",
            Operation::Checkpoint => "checkpoint",
            Operation::Stats => "stats",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn context_suffix(context: &Option<String>) -> String {
    context.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default()
}

#[derive(Debug, Clone, Error)]
#[error("{kind} in {operation}{}: {message}", context_suffix(.context))]
pub struct CacheError {
    kind: CacheErrorKind,
    operation: Operation,
    context: Option<String>,
    message: String,
    status: Option<OcrCacheStatus>,
    cause: Option<OpenFailure>,
}

macro_rules! error_constructor {
    ($name:ident, $kind:ident) => {
        pastey::paste! {
            #[doc = "Create a " $kind " error"]
            pub fn $name<S: Into<String>>(operation: Operation, message: S) -> Self {
                Self::new(CacheErrorKind::$kind, operation, message)
            }

            #[doc = "Create a " $kind " error carrying the engine status"]
            pub fn [<$name _with_status>]<S: Into<String>>(
                operation: Operation,
                status: Option<OcrCacheStatus>,
                message: S,
            ) -> Self {
                let mut err = Self::new(CacheErrorKind::$kind, operation, message);
                err.status = status;
                err
            }
        }
    };
}

impl CacheError {
    pub fn new<S: Into<String>>(kind: CacheErrorKind, operation: Operation, message: S) -> Self {
        Self {
            kind,
            operation,
            context: None,
            message: message.into(),
            status: None,
            cause: None,
        }
    }

    error_constructor!(native_unavailable, NativeUnavailable);
    error_constructor!(open_failed, OpenFailed);
    error_constructor!(operation_failed, OperationFailed);
    error_constructor!(handle_invalid, HandleInvalid);
    error_constructor!(encoding_error, EncodingError);

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub(crate) fn with_status(mut self, status: Option<OcrCacheStatus>) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn with_cause(mut self, cause: OpenFailure) -> Self {
        self.cause = Some(cause);
        self
    }

    /// The same failure reported against another operation, for a manager
    /// whose open never succeeded.
    pub(crate) fn replay(&self, operation: Operation) -> Self {
        Self {
            kind: self.kind,
            operation,
            context: self.context.clone(),
            message: format!("cache was never initialized: {}", self.message),
            status: self.status,
            cause: self.cause,
        }
    }

    pub fn kind(&self) -> CacheErrorKind {
        self.kind
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<OcrCacheStatus> {
        self.status
    }

    pub fn open_failure(&self) -> Option<OpenFailure> {
        self.cause
    }

    /// Short machine-friendly classification, e.g. `open_failed/corrupt`.
    pub fn error_type(&self) -> String {
        let kind = serde_json::to_value(self.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| self.kind.as_str().to_string());
        match self.cause {
            Some(cause) => {
                let cause = serde_json::to_value(cause)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                format!("{}/{}", kind, cause)
            }
            None => kind,
        }
    }

    /// Operator-facing remediation hints for this failure.
    pub fn suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match (self.kind, self.cause) {
            (CacheErrorKind::NativeUnavailable, _) => &[
                "Check that the ocr-cache engine was built from the same release as the application",
                "Set enabled = true in ocr-cache.toml and unset OCR_CACHE_DISABLE to use the native cache",
            ],
            (CacheErrorKind::OpenFailed, Some(OpenFailure::Unwritable)) => &[
                "Check that the cache directory exists and is writable by the current user",
                "Point db_path (or OCR_CACHE_DB) at a writable location",
            ],
            (CacheErrorKind::OpenFailed, Some(OpenFailure::Locked)) => &[
                "Close other application instances that use the same cache database",
                "Give each process its own db_path",
            ],
            (CacheErrorKind::OpenFailed, Some(OpenFailure::SchemaMismatch)) => &[
                "The database was written by an incompatible version; move it aside or delete it",
                "Check that db_path does not point at an unrelated SQLite file",
            ],
            (CacheErrorKind::OpenFailed, Some(OpenFailure::Corrupt)) => &[
                "Set rebuild_on_corruption = true to back up and recreate the database automatically",
                "Delete the database file and its -wal side file to start with an empty cache",
            ],
            (CacheErrorKind::OpenFailed, Some(OpenFailure::InvalidPath)) => {
                &["Configure db_path as a UTF-8 file path, not a directory"]
            }
            (CacheErrorKind::OpenFailed, _) => &[
                "Check free disk space and file system health",
                "Run `ocr-cache diagnose` for a full report",
            ],
            (CacheErrorKind::OperationFailed, _) => &[
                "The cache remains usable; retry the operation",
                "Run `ocr-cache diagnose` if the failure repeats",
            ],
            (CacheErrorKind::HandleInvalid, _) => &[
                "Create a new cache instance to reopen the database",
                "Run `ocr-cache diagnose` to check the database file",
            ],
            (CacheErrorKind::EncodingError, _) => &[
                "Check records for non-finite coordinates",
                "Use UTF-8 database paths",
            ],
        };
        hints.iter().map(|h| h.to_string()).collect()
    }
}
