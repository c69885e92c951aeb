//! Cache configuration.
//!
//! Loaded from `ocr-cache.toml` (or JSON), discovered by walking up from the
//! current directory, then adjusted by environment overrides:
//!
//! - `OCR_CACHE_DISABLE=1` forces the disabled engine
//! - `OCR_CACHE_DB=<path>` replaces `db_path`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ocr_cache_engine::OpenOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::native::{DisabledEngine, EngineLoader, LinkedEngine};

pub const CONFIG_FILE_NAMES: [&str; 2] = ["ocr-cache.toml", ".ocr-cache.toml"];
pub const ENV_DISABLE: &str = "OCR_CACHE_DISABLE";
pub const ENV_DB_PATH: &str = "OCR_CACHE_DB";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {message}")]
    Toml { path: PathBuf, message: String },

    #[error("Invalid JSON in {path}: {message}")]
    Json { path: PathBuf, message: String },

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Cannot determine current directory: {0}")]
    CurrentDir(#[source] std::io::Error),
}

/// When [`crate::SafeCache::from_config`] opens the database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    /// On the first cache operation.
    #[default]
    Lazy,
    /// Immediately, during construction.
    Eager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default)]
    pub init: InitMode,

    /// Back up and recreate a database that automatic repair cannot fix.
    #[serde(default)]
    pub rebuild_on_corruption: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            init: InitMode::Lazy,
            rebuild_on_corruption: false,
        }
    }
}

impl CacheConfig {
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Configured path, or `.ocr_cache/ocr_cache.db` under the current directory.
    pub fn resolved_db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => path.clone(),
            None => {
                let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                path.push(".ocr_cache");
                path.push("ocr_cache.db");
                path
            }
        }
    }

    pub fn open_flags(&self) -> u32 {
        if self.rebuild_on_corruption {
            OpenOptions::REBUILD_CORRUPT
        } else {
            0
        }
    }

    /// The engine loader this configuration selects.
    pub fn loader(&self) -> Arc<dyn EngineLoader> {
        if self.enabled {
            Arc::new(LinkedEngine)
        } else {
            Arc::new(DisabledEngine::new("cache disabled by configuration"))
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        toml::from_str(&content).map_err(|e| ConfigError::Toml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Json {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load configuration, choosing the format from the file extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("<none>").to_string())),
        }
    }

    /// Discover configuration file in the current directory or its parents.
    pub fn discover() -> Result<Option<Self>, ConfigError> {
        let current = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
        Self::discover_from(&current)
    }

    /// Search `start` and its parents for `ocr-cache.toml`, then `.ocr-cache.toml`.
    pub fn discover_from(start: &Path) -> Result<Option<Self>, ConfigError> {
        let mut current = Some(start);
        while let Some(dir) = current {
            for name in CONFIG_FILE_NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    tracing::debug!("Using cache config {}", candidate.display());
                    return Self::from_toml_file(candidate).map(Some);
                }
            }
            current = dir.parent();
        }
        Ok(None)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(ENV_DISABLE)
            && is_truthy(&value)
        {
            tracing::info!("OCR cache disabled via {}", ENV_DISABLE);
            self.enabled = false;
        }
        if let Ok(path) = std::env::var(ENV_DB_PATH)
            && !path.is_empty()
        {
            self.db_path = Some(PathBuf::from(path));
        }
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
