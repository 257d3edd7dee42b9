//! Test logging helpers.

/// Install a compact tracing subscriber routed through the test writer.
///
/// Safe to call from every test; only the first call installs anything.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}
