//! Health snapshots for operator tooling.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{CacheError, CacheErrorKind, OpenFailure};
use crate::types::{StoreStats, now_ms};
use crate::wrapper::CacheState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Ready and serving.
    Healthy,
    /// Intentionally inert: the engine is disabled.
    Degraded,
    /// The engine or the database failed.
    Unhealthy,
    /// Not initialized yet, or closed.
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

pub(crate) struct HealthInputs {
    pub state: CacheState,
    pub loaded: bool,
    pub backend: String,
    pub engine_abi: Option<u32>,
    pub db_path: PathBuf,
    pub init_error: Option<CacheError>,
    pub last_error: Option<CacheError>,
    pub recovery: Option<String>,
    pub stats: Option<StoreStats>,
}

/// What failed and why, as of `checked_at`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub state: CacheState,
    /// Engine entry points resolved and ABI version accepted.
    pub loaded: bool,
    pub ready: bool,
    pub last_error: Option<String>,
    pub error_kind: Option<CacheErrorKind>,
    pub open_failure: Option<OpenFailure>,
    pub suggestions: Vec<String>,
    pub backend: String,
    pub engine_abi: Option<u32>,
    pub db_path: PathBuf,
    /// Repair report, when the engine fixed the database during open.
    pub recovery: Option<String>,
    pub stats: Option<StoreStats>,
    pub message: String,
    pub checked_at: u64,
}

impl CacheHealth {
    pub(crate) fn from_inputs(inputs: HealthInputs) -> Self {
        let ready = inputs.state == CacheState::Ready;
        // The init failure explains a degraded cache better than any later call.
        let error = inputs.init_error.or(inputs.last_error);

        let status = match inputs.state {
            CacheState::Ready => HealthStatus::Healthy,
            CacheState::Degraded if inputs.backend == "disabled" => HealthStatus::Degraded,
            CacheState::Degraded => HealthStatus::Unhealthy,
            CacheState::Uninitialized | CacheState::Initializing | CacheState::Closed => HealthStatus::Unknown,
        };

        let message = match (inputs.state, &error) {
            (CacheState::Ready, _) => format!("OCR cache ready at {}", inputs.db_path.display()),
            (CacheState::Degraded, Some(err)) if err.kind() == CacheErrorKind::NativeUnavailable => {
                format!("OCR cache engine unavailable: {}", err.message())
            }
            (CacheState::Degraded, Some(err)) => match err.open_failure() {
                Some(cause) => format!("OCR cache unavailable ({}): {}", cause, err.message()),
                None => format!("OCR cache unavailable: {}", err.message()),
            },
            (CacheState::Degraded, None) => "OCR cache unavailable".to_string(),
            (CacheState::Closed, _) => "OCR cache closed".to_string(),
            (CacheState::Uninitialized | CacheState::Initializing, _) => "OCR cache not initialized".to_string(),
        };

        Self {
            status,
            state: inputs.state,
            loaded: inputs.loaded,
            ready,
            last_error: error.as_ref().map(|e| e.to_string()),
            error_kind: error.as_ref().map(|e| e.kind()),
            open_failure: error.as_ref().and_then(|e| e.open_failure()),
            suggestions: error.as_ref().map(|e| e.suggestions()).unwrap_or_default(),
            backend: inputs.backend,
            engine_abi: inputs.engine_abi,
            db_path: inputs.db_path,
            recovery: inputs.recovery,
            stats: inputs.stats,
            message,
            checked_at: now_ms(),
        }
    }

    /// Emit the snapshot at a level matching its status.
    pub fn log(&self) {
        match self.status {
            HealthStatus::Healthy => tracing::info!(
                state = %self.state,
                db_path = %self.db_path.display(),
                "{}",
                self.message
            ),
            HealthStatus::Unknown => tracing::debug!(state = %self.state, "{}", self.message),
            HealthStatus::Degraded | HealthStatus::Unhealthy => tracing::warn!(
                state = %self.state,
                loaded = self.loaded,
                error = self.last_error.as_deref().unwrap_or(""),
                "{}",
                self.message
            ),
        }
        if let Some(recovery) = &self.recovery {
            tracing::warn!("OCR cache repaired on open: {}", recovery);
        }
    }
}

impl fmt::Display for CacheHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Status:   {}", self.status.as_str())?;
        writeln!(f, "State:    {}", self.state)?;
        writeln!(f, "Backend:  {}", self.backend)?;
        match self.engine_abi {
            Some(abi) => writeln!(f, "Engine:   loaded (ABI v{})", abi)?,
            None => writeln!(f, "Engine:   {}", if self.loaded { "loaded" } else { "not loaded" })?,
        }
        writeln!(f, "Database: {}", self.db_path.display())?;
        if let Some(stats) = &self.stats {
            writeln!(
                f,
                "Contents: {} results, {} sessions ({} pages)",
                stats.results, stats.sessions, stats.session_pages
            )?;
            writeln!(f, "Size:     {} bytes (+{} bytes WAL)", stats.database_bytes, stats.wal_bytes)?;
        }
        if let Some(recovery) = &self.recovery {
            writeln!(f, "Recovery: {}", recovery)?;
        }
        if let Some(error) = &self.last_error {
            writeln!(f, "Error:    {}", error)?;
        }
        if !self.suggestions.is_empty() {
            writeln!(f, "Suggestions:")?;
            for suggestion in &self.suggestions {
                writeln!(f, "  - {}", suggestion)?;
            }
        }
        write!(f, "{}", self.message)
    }
}
