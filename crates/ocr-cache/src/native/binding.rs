//! Typed calls over the engine's C ABI.
//!
//! Each call validates the handle (by construction: a [`NativeHandle`] only
//! exists for a successful open), encodes inputs as pointer + length, invokes
//! the entry point, adopts any returned buffer into a [`NativeBuffer`] guard
//! before inspecting the status, and maps the status into a [`CacheError`].
//! Buffers are released when their guard drops, on every path.

#![allow(unsafe_code)]

use std::num::NonZeroU64;
use std::path::Path;

use ocr_cache_engine::{NULL_HANDLE, OcrCacheBuffer, OcrCacheHandle, OcrCacheStatus};

use super::api::{BufferFreeFn, NativeApi};
use crate::error::{CacheError, CacheErrorKind, OpenFailure, Operation, Result};

/// Owns one engine-allocated buffer and frees it exactly once.
pub struct NativeBuffer {
    free: BufferFreeFn,
    raw: OcrCacheBuffer,
}

impl NativeBuffer {
    pub fn adopt(free: BufferFreeFn, raw: OcrCacheBuffer) -> Self {
        Self { free, raw }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.raw.is_empty() {
            return &[];
        }
        // SAFETY: the engine guarantees data points to len initialized bytes
        // until the buffer is freed, and we free only in Drop.
        unsafe { std::slice::from_raw_parts(self.raw.data, self.raw.len) }
    }

    pub fn to_str(&self, operation: Operation) -> Result<&str> {
        std::str::from_utf8(self.as_bytes())
            .map_err(|e| CacheError::encoding_error(operation, format!("engine returned invalid UTF-8: {}", e)))
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        let raw = std::mem::take(&mut self.raw);
        if !raw.is_empty() {
            // SAFETY: raw came from the engine unmodified and is released only here.
            unsafe { (self.free)(raw) };
        }
    }
}

/// An open engine handle. Not `Clone`; closing happens exactly once, in `Drop`.
#[derive(Debug)]
pub struct NativeHandle {
    api: NativeApi,
    raw: NonZeroU64,
}

impl NativeHandle {
    pub fn open(api: NativeApi, path: &Path, flags: u32) -> Result<Self> {
        let path_str = path.to_str().ok_or_else(|| {
            CacheError::encoding_error(Operation::Open, "database path is not valid UTF-8")
                .with_context(path.display().to_string())
                .with_cause(OpenFailure::InvalidPath)
        })?;

        let mut raw: OcrCacheHandle = NULL_HANDLE;
        let mut err = OcrCacheBuffer::empty();
        // SAFETY: path_str covers path_str.len() bytes; both out-params are valid locals.
        let code = unsafe { (api.open)(path_str.as_ptr(), path_str.len(), flags, &mut raw, &mut err) };
        let err = NativeBuffer::adopt(api.buffer_free, err);

        if code != OcrCacheStatus::Ok.code() {
            if raw != NULL_HANDLE {
                // A failing open must not leave a handle behind.
                // SAFETY: handle-only call on a token the engine just issued.
                unsafe { (api.close)(raw) };
            }
            let status = OcrCacheStatus::from_code(code);
            let message = if err.is_empty() {
                format!("engine returned status {}", code)
            } else {
                err.to_string_lossy()
            };
            return Err(CacheError::open_failed_with_status(Operation::Open, status, message)
                .with_context(path.display().to_string())
                .with_cause(OpenFailure::from_status(status)));
        }

        match NonZeroU64::new(raw) {
            Some(raw) => Ok(Self { api, raw }),
            None => Err(CacheError::open_failed(Operation::Open, "engine reported success without a handle")
                .with_context(path.display().to_string())
                .with_cause(OpenFailure::Other)),
        }
    }

    pub fn put_result(&self, key: &str, record: &str) -> Result<()> {
        // SAFETY: key and record cover their lengths for the duration of the call.
        let code = unsafe {
            (self.api.put_result)(self.raw.get(), key.as_ptr(), key.len(), record.as_ptr(), record.len())
        };
        self.check(Operation::SaveResult, code)
            .map_err(|e| e.with_context(format!("key {}", key)))
    }

    pub fn get_all_results(&self) -> Result<String> {
        let buffer = self.read(Operation::LoadAll, |out| {
            // SAFETY: out is a valid local buffer slot.
            unsafe { (self.api.get_all_results)(self.raw.get(), out) }
        })?;
        buffer.to_str(Operation::LoadAll).map(str::to_string)
    }

    pub fn put_session(&self, id: &str, session: &str) -> Result<()> {
        // SAFETY: session covers session.len() bytes for the duration of the call.
        let code = unsafe { (self.api.put_session)(self.raw.get(), session.as_ptr(), session.len()) };
        self.check(Operation::SaveSession, code)
            .map_err(|e| e.with_context(format!("session {}", id)))
    }

    pub fn append_session_page(&self, id: &str, record: &str) -> Result<()> {
        // SAFETY: id and record cover their lengths for the duration of the call.
        let code = unsafe {
            (self.api.append_session_page)(self.raw.get(), id.as_ptr(), id.len(), record.as_ptr(), record.len())
        };
        self.check(Operation::AppendSessionPage, code)
            .map_err(|e| e.with_context(format!("session {}", id)))
    }

    /// `Ok(None)` when the session does not exist.
    pub fn get_session(&self, id: &str) -> Result<Option<String>> {
        let mut out = OcrCacheBuffer::empty();
        // SAFETY: id covers id.len() bytes; out is a valid local buffer slot.
        let code = unsafe { (self.api.get_session)(self.raw.get(), id.as_ptr(), id.len(), &mut out) };
        let buffer = NativeBuffer::adopt(self.api.buffer_free, out);

        if code == OcrCacheStatus::NotFound.code() {
            return Ok(None);
        }
        self.check(Operation::LoadSession, code)
            .map_err(|e| e.with_context(format!("session {}", id)))?;
        buffer.to_str(Operation::LoadSession).map(|s| Some(s.to_string()))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let mut found = false;
        // SAFETY: key covers key.len() bytes; found is a valid local.
        let code = unsafe { (self.api.exists)(self.raw.get(), key.as_ptr(), key.len(), &mut found) };
        self.check(Operation::HasCache, code)
            .map_err(|e| e.with_context(format!("key {}", key)))?;
        Ok(found)
    }

    pub fn clear(&self) -> Result<()> {
        // SAFETY: handle-only call.
        let code = unsafe { (self.api.clear)(self.raw.get()) };
        self.check(Operation::ClearCache, code)
    }

    pub fn checkpoint(&self) -> Result<()> {
        // SAFETY: handle-only call.
        let code = unsafe { (self.api.checkpoint)(self.raw.get()) };
        self.check(Operation::Checkpoint, code)
    }

    pub fn stats(&self) -> Result<String> {
        let buffer = self.read(Operation::Stats, |out| {
            // SAFETY: out is a valid local buffer slot.
            unsafe { (self.api.stats)(self.raw.get(), out) }
        })?;
        buffer.to_str(Operation::Stats).map(str::to_string)
    }

    /// The engine's message for the most recent call on this handle.
    pub fn last_error(&self) -> Option<String> {
        let mut out = OcrCacheBuffer::empty();
        // SAFETY: out is a valid local buffer slot.
        let code = unsafe { (self.api.last_error)(self.raw.get(), &mut out) };
        let buffer = NativeBuffer::adopt(self.api.buffer_free, out);
        if code != OcrCacheStatus::Ok.code() || buffer.is_empty() {
            return None;
        }
        Some(buffer.to_string_lossy())
    }

    fn read(&self, operation: Operation, call: impl FnOnce(*mut OcrCacheBuffer) -> i32) -> Result<NativeBuffer> {
        let mut out = OcrCacheBuffer::empty();
        let code = call(&mut out);
        let buffer = NativeBuffer::adopt(self.api.buffer_free, out);
        self.check(operation, code)?;
        Ok(buffer)
    }

    /// Maps a status code, reading the error slot before any other call can overwrite it.
    fn check(&self, operation: Operation, code: i32) -> Result<()> {
        if code == OcrCacheStatus::Ok.code() {
            return Ok(());
        }
        let status = OcrCacheStatus::from_code(code);
        let message = self.last_error().unwrap_or_else(|| match status {
            Some(status) => format!("engine returned {}", status),
            None => format!("engine returned unknown status {}", code),
        });
        let kind = match status {
            Some(OcrCacheStatus::InvalidHandle | OcrCacheStatus::Corrupt | OcrCacheStatus::Io) => {
                CacheErrorKind::HandleInvalid
            }
            Some(OcrCacheStatus::Encoding) => CacheErrorKind::EncodingError,
            _ => CacheErrorKind::OperationFailed,
        };
        tracing::debug!("Cache {} failed with status {}: {}", operation, code, message);
        Err(CacheError::new(kind, operation, message).with_status(status))
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        // SAFETY: handle-only call; the raw token is never used again.
        let code = unsafe { (self.api.close)(self.raw.get()) };
        if code != OcrCacheStatus::Ok.code() {
            tracing::debug!("Closing cache handle returned status {}", code);
        }
    }
}
