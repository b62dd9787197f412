//! Diagnostics go to stderr through `tracing`; stdout is reserved for results.

mod format;

pub use format::{emit_json, StructuredLogger};
