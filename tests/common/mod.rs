//! Shared test setup.

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initializes tracing output for tests; safe to call from every test.
///
/// Honors `RUST_LOG`; defaults to warnings only so passing runs stay quiet.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
