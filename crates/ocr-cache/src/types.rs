use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Fixed seeds keep fingerprints stable across runs of the same build.
const FINGERPRINT_SEEDS: [(u64, u64, u64, u64); 2] = [
    (0x243f_6a88_85a3_08d3, 0x1319_8a2e_0370_7344, 0xa409_3822_299f_31d0, 0x082e_fa98_ec4e_6c89),
    (0x4528_21e6_38d0_1377, 0xbe54_66cf_34e9_0c6c, 0xc0ac_29b7_c97c_50dd, 0x3f84_d5b5_b547_0917),
];

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Identifies one OCR invocation: which engine ran over which content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub engine: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(engine: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Derive the key from raw input bytes (image or PDF page).
    ///
    /// The fingerprint is 32 hex characters from two independently seeded
    /// passes. It is stable for a given build of this crate, not across
    /// hasher upgrades.
    pub fn from_content(content: &[u8], engine: impl Into<String>) -> Self {
        let fingerprint = FINGERPRINT_SEEDS
            .iter()
            .map(|&(a, b, c, d)| format!("{:016x}", ahash::RandomState::with_seeds(a, b, c, d).hash_one(content)))
            .collect::<String>();
        Self::new(engine, fingerprint)
    }

    /// Storage form, `<engine byte length>:engine:fingerprint`.
    ///
    /// The length prefix keeps keys distinct when either part contains `:`.
    pub fn as_storage_key(&self) -> String {
        format!("{}:{}:{}", self.engine.len(), self.engine, self.fingerprint)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.engine, self.fingerprint)
    }
}

/// A recognized text box in page coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub text: String,
}

impl TextRegion {
    /// Corners are normalized so `x1 <= x2` and `y1 <= y2`.
    ///
    /// Non-finite coordinates are kept as given so [`ResultRecord::validate`]
    /// can reject them.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64, text: impl Into<String>) -> Self {
        let (x1, x2) = ordered(x1, x2);
        let (y1, y2) = ordered(y1, y2);
        Self {
            x1,
            y1,
            x2,
            y2,
            text: text.into(),
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite())
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if b < a { (b, a) } else { (a, b) }
}

/// Why a record cannot be stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{0}")]
    Invalid(String),
    /// JSON has no NaN or infinity.
    #[error("{0}")]
    Unrepresentable(String),
}

impl RecordError {
    fn in_page(self, index: usize) -> Self {
        match self {
            RecordError::Invalid(msg) => RecordError::Invalid(format!("page {}: {}", index, msg)),
            RecordError::Unrepresentable(msg) => RecordError::Unrepresentable(format!("page {}: {}", index, msg)),
        }
    }
}

fn default_status() -> String {
    "recognized".to_string()
}

/// Output of one OCR invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub key: CacheKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub regions: Vec<TextRegion>,
    #[serde(default)]
    pub recognized_at: u64,
    #[serde(default)]
    pub engine_metadata: HashMap<String, serde_json::Value>,
}

impl ResultRecord {
    pub fn new(key: CacheKey, text: impl Into<String>) -> Self {
        Self {
            key,
            source_path: None,
            status: default_status(),
            text: text.into(),
            regions: Vec::new(),
            recognized_at: now_ms(),
            engine_metadata: HashMap::new(),
        }
    }

    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_region(mut self, region: TextRegion) -> Self {
        self.regions.push(region);
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.engine_metadata.insert(name.into(), value);
        self
    }

    /// Checks that the record can be stored and read back unchanged.
    pub fn validate(&self) -> std::result::Result<(), RecordError> {
        if self.key.engine.is_empty() {
            return Err(RecordError::Invalid("cache key has an empty engine name".to_string()));
        }
        if self.key.fingerprint.is_empty() {
            return Err(RecordError::Invalid("cache key has an empty fingerprint".to_string()));
        }
        if let Some(index) = self.regions.iter().position(|r| !r.is_finite()) {
            return Err(RecordError::Unrepresentable(format!(
                "region {} has a non-finite coordinate",
                index
            )));
        }
        Ok(())
    }
}

/// A multi-page batch: pages in processing order plus the viewer cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub pages: Vec<ResultRecord>,
    #[serde(default)]
    pub current_index: usize,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            pages: Vec::new(),
            current_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_pages(mut self, pages: Vec<ResultRecord>) -> Self {
        self.pages = pages;
        self
    }

    pub fn push_page(&mut self, page: ResultRecord) {
        self.pages.push(page);
        self.updated_at = now_ms();
    }

    pub fn validate(&self) -> std::result::Result<(), RecordError> {
        if self.id.is_empty() {
            return Err(RecordError::Invalid("session id is empty".to_string()));
        }
        for (index, page) in self.pages.iter().enumerate() {
            page.validate().map_err(|e| e.in_page(index))?;
        }
        Ok(())
    }
}

/// Store counters reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub results: u64,
    pub sessions: u64,
    pub session_pages: u64,
    pub database_bytes: u64,
    pub wal_bytes: u64,
    pub schema_version: u32,
    pub recovered: bool,
}

impl StoreStats {
    pub fn is_empty(&self) -> bool {
        self.results == 0 && self.sessions == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic_and_wide() {
        let a = CacheKey::from_content(b"page bytes", "tesseract");
        let b = CacheKey::from_content(b"page bytes", "tesseract");
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 32);
        assert!(a.fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_differs_by_content() {
        let a = CacheKey::from_content(b"page one", "tesseract");
        let b = CacheKey::from_content(b"page two", "tesseract");
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_key_display() {
        let key = CacheKey::new("paddle", "abc123");
        assert_eq!(key.to_string(), "paddle:abc123");
        assert_eq!(key.as_storage_key(), "6:paddle:abc123");
    }

    #[test]
    fn test_storage_key_separates_colon_parts() {
        let a = CacheKey::new("a:b", "c");
        let b = CacheKey::new("a", "b:c");
        assert_ne!(a.as_storage_key(), b.as_storage_key());
    }

    #[test]
    fn test_region_normalizes_corners() {
        let region = TextRegion::new(10.0, 40.0, 2.0, 5.0, "Total");
        assert_eq!((region.x1, region.y1, region.x2, region.y2), (2.0, 5.0, 10.0, 40.0));
    }

    #[test]
    fn test_record_defaults_when_fields_missing() {
        let record: ResultRecord =
            serde_json::from_str(r#"{"key":{"engine":"tesseract","fingerprint":"ff"}}"#).unwrap();
        assert_eq!(record.status, "recognized");
        assert!(record.text.is_empty());
        assert!(record.regions.is_empty());
    }

    #[test]
    fn test_region_keeps_non_finite_coordinates() {
        let region = TextRegion::new(0.0, 0.0, f64::NAN, 1.0, "bad");
        assert!(region.x2.is_nan());
        assert!(!region.is_finite());

        let region = TextRegion::new(f64::INFINITY, 3.0, 1.0, 2.0, "wide");
        assert_eq!((region.x1, region.x2), (1.0, f64::INFINITY));
        assert_eq!((region.y1, region.y2), (2.0, 3.0));
    }

    #[test]
    fn test_validate_rejects_non_finite_region() {
        let record = ResultRecord::new(CacheKey::new("tesseract", "ff"), "x")
            .with_region(TextRegion::new(0.0, 0.0, f64::NAN, 1.0, "bad"));
        match record.validate().unwrap_err() {
            RecordError::Unrepresentable(msg) => assert!(msg.contains("region 0")),
            other => panic!("expected Unrepresentable, got {:?}", other),
        }
    }

    #[test]
    fn test_session_validate_names_bad_page() {
        let good = ResultRecord::new(CacheKey::new("tesseract", "a"), "ok");
        let bad = ResultRecord::new(CacheKey::new("", "b"), "bad");
        let session = SessionRecord::new("batch").with_pages(vec![good, bad]);
        let err = session.validate().unwrap_err();
        assert!(matches!(err, RecordError::Invalid(_)));
        assert!(err.to_string().starts_with("page 1"));
        assert!(SessionRecord::new("").validate().is_err());
    }

    #[test]
    fn test_push_page_keeps_order() {
        let mut session = SessionRecord::new("batch");
        for i in 0..3 {
            session.push_page(ResultRecord::new(CacheKey::new("tesseract", i.to_string()), format!("page {}", i)));
        }
        let texts: Vec<_> = session.pages.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["page 0", "page 1", "page 2"]);
        assert!(session.updated_at >= session.created_at);
    }
}
