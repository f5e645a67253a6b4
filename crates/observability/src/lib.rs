//! Tracing and logging setup shared by every fhirmat process.

/// Initialize process-wide logging with the format taken from
/// `FHIRMAT_LOG_FORMAT` (`json` by default, `text` for local use).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::LogFormat;
