//! Tracing and logging setup shared by binaries.

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use tracing::LogFormat;

/// Initialize process-wide tracing with `RUST_LOG` (default `info`) and the
/// format selected by `LOG_FORMAT` (`json` by default, `pretty` for local dev).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env(), "info");
}
