//! Length-prefixed byte buffers handed across the ABI.
//!
//! Every buffer the engine returns is owned by the caller until it is passed
//! back to `ocr_cache_buffer_free`. Allocations are tracked in a process-wide
//! registry so that:
//!
//! - releasing an unknown or already-released buffer is a logged no-op instead
//!   of a double free
//! - `ocr_cache_live_buffers()` reports how many buffers are still outstanding
//!
//! Empty payloads are returned as `{ data: NULL, len: 0 }` and never allocate.

use std::ptr;

use ahash::AHashSet;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

static LIVE_BUFFERS: Lazy<Mutex<AHashSet<usize>>> = Lazy::new(|| Mutex::new(AHashSet::new()));

/// UTF-8 bytes with an explicit length. Not NUL-terminated.
#[repr(C)]
#[derive(Debug)]
pub struct OcrCacheBuffer {
    pub data: *mut u8,
    pub len: usize,
}

impl OcrCacheBuffer {
    pub const fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_null() || self.len == 0
    }

    /// Moves `bytes` onto the heap and registers the allocation.
    pub(crate) fn from_vec(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        let boxed = bytes.into_boxed_slice();
        let len = boxed.len();
        let data = Box::into_raw(boxed) as *mut u8;
        LIVE_BUFFERS.lock().insert(data as usize);
        Self { data, len }
    }

    pub(crate) fn from_string(s: String) -> Self {
        Self::from_vec(s.into_bytes())
    }

    /// Releases a buffer produced by [`OcrCacheBuffer::from_vec`].
    ///
    /// Returns `false` if the buffer was not live (already released or never
    /// allocated here); nothing is freed in that case.
    ///
    /// # Safety
    ///
    /// `self.len` must be the length the buffer was allocated with.
    pub(crate) unsafe fn release(self) -> bool {
        if self.data.is_null() {
            return true;
        }
        if !LIVE_BUFFERS.lock().remove(&(self.data as usize)) {
            return false;
        }
        // SAFETY: the address was registered by `from_vec`, which leaked a boxed slice of `len` bytes.
        unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.data, self.len))) };
        true
    }
}

impl Default for OcrCacheBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

pub(crate) fn live_buffer_count() -> usize {
    LIVE_BUFFERS.lock().len()
}

/// Borrows caller-supplied bytes as `&str`.
///
/// # Safety
///
/// `data` must point to `len` readable bytes, or be NULL with `len == 0`.
pub(crate) unsafe fn borrow_str<'a>(data: *const u8, len: usize, what: &str) -> crate::error::Result<&'a str> {
    use crate::error::{EngineError, OcrCacheStatus};

    let bytes = if len == 0 {
        &[][..]
    } else if data.is_null() {
        return Err(EngineError::new(
            OcrCacheStatus::NullPointer,
            format!("{} cannot be NULL", what),
        ));
    } else {
        // SAFETY: caller guarantees `data` points to `len` readable bytes.
        unsafe { std::slice::from_raw_parts(data, len) }
    };

    std::str::from_utf8(bytes)
        .map_err(|e| EngineError::new(OcrCacheStatus::Encoding, format!("Invalid UTF-8 in {}: {}", what, e)))
}
