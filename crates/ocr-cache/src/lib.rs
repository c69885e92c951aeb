//! OCR Cache - crash-safe result and session cache for OCR pipelines
//!
//! Stores recognized pages and multi-page sessions in a durable native store,
//! behind a wrapper that turns every cache problem into a harmless no-op.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ocr_cache::{CacheConfig, CacheKey, ResultRecord, SafeCache};
//!
//! let cache = SafeCache::from_config(CacheConfig::default());
//!
//! let key = CacheKey::from_content(b"...page bytes...", "tesseract");
//! if !cache.has_cache(&key) {
//!     cache.save_result(&ResultRecord::new(key, "recognized text"));
//! }
//!
//! for record in cache.load_all() {
//!     println!("{}: {}", record.key, record.text);
//! }
//!
//! if !cache.health().ready {
//!     eprintln!("{}", cache.health());
//! }
//! ```
//!
//! # Architecture
//!
//! - **Native engine** (`ocr-cache-engine`): SQLite store behind a C ABI
//! - **Binding** (`native`): typed calls, buffer and handle ownership
//! - **Manager** (`manager`): one handle, one error taxonomy
//! - **Wrapper** (`wrapper`): lifecycle, single-flight init, degradation
//! - **Health** (`health`): diagnostic snapshots
//!
//! Code that does not use the cache never needs a `SafeCache`; the wrapper is
//! an optional collaborator, not a dependency of OCR itself.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod native;
pub mod types;
pub mod wrapper;

pub use config::{CacheConfig, ConfigError, InitMode};
pub use error::{CacheError, CacheErrorKind, OpenFailure, Operation, Result};
pub use health::{CacheHealth, HealthStatus};
pub use manager::CacheManager;
pub use native::{DisabledEngine, EngineLoader, LinkedEngine, NativeApi};
pub use types::{CacheKey, RecordError, ResultRecord, SessionRecord, StoreStats, TextRegion};
pub use wrapper::{CacheState, SafeCache};

pub use ocr_cache_engine::{OCR_CACHE_ABI_VERSION, OcrCacheStatus};
