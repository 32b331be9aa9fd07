//! Process-wide logging setup shared by the settlement binaries.

/// Initialize JSON logging filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json, "info");
}

/// Subscriber construction (format, filter).
pub mod tracing;

pub use self::tracing::LogFormat;
