//! `tracing` subscriber setup shared by the binaries.

use tracing_subscriber::EnvFilter;

/// Installs a stderr formatter. `RUST_LOG` wins over `fallback_filter`.
/// Calling it twice is harmless; the second install is ignored.
pub fn init(fallback_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
