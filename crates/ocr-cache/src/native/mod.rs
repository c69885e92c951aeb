//! Boundary to the native storage engine.
//!
//! [`api`] resolves the engine's entry points into a [`NativeApi`] table;
//! [`binding`] wraps each entry point in a typed call that owns every buffer
//! and handle it receives.

pub mod api;
pub mod binding;

pub use api::{DisabledEngine, EngineLoader, LinkedEngine, LoadedEngine, NativeApi, load_engine};
pub use binding::{NativeBuffer, NativeHandle};
