use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable consulted for the log filter.
const RUST_LOG_ENV_NAME: &str = "RUST_LOG";

/// Environment variable that turns on logging in tests.
const ENABLE_TEST_LOGS_ENV_NAME: &str = "ENABLE_TRACING";

static TEST_TRACING: Once = Once::new();

/// Installs the global tracing subscriber for a binary.
///
/// The filter is read from `RUST_LOG`; when it is unset, `{app_name}=info,fanout=info` is used.
/// Returns an error if a global subscriber was already installed.
pub fn init_tracing(app_name: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_env(RUST_LOG_ENV_NAME)
        .unwrap_or_else(|_| EnvFilter::new(default_directives(app_name)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}

/// Installs a test writer subscriber once per process.
///
/// Output is only produced when `ENABLE_TRACING` is set, so test runs stay quiet by default.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TEST_LOGS_ENV_NAME).is_err() {
            return;
        }

        let filter = EnvFilter::try_from_env(RUST_LOG_ENV_NAME)
            .unwrap_or_else(|_| EnvFilter::new("fanout=debug"));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

fn default_directives(app_name: &str) -> String {
    let app_name = app_name.replace('-', "_");
    format!("{app_name}=info,fanout=info")
}
