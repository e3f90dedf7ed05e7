use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber for a service binary.
///
/// The filter is taken from `RUST_LOG` when set, defaulting to `info`.
pub fn init_tracing(service_name: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    ::tracing::info!(service = service_name, "tracing initialized");
}

static TEST_TRACING: Once = Once::new();

/// Initializes tracing for tests.
///
/// Safe to call from every test; only the first call installs the
/// subscriber. Output goes through the test writer so it is captured per
/// test.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .init();
    });
}
