use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the global tracing subscriber.
///
/// Events go to stderr so that stdout stays reserved for progress lines and listings the
/// platform shows to the user. `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`].
pub fn init_tracing(app_name: &str) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()?;

    tracing::debug!(app_name, "tracing initialized");

    Ok(())
}

static INIT_TEST_TRACING: Once = Once::new();

/// Installs a subscriber writing through the test harness, once per test binary.
///
/// Only enabled when `ENABLE_TRACING` is set, so test output stays quiet by default.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var_os("ENABLE_TRACING").is_none() {
            return;
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialization_fails_without_panicking() {
        let first = init_tracing("bq-telemetry-test");
        let second = init_tracing("bq-telemetry-test");

        assert!(first.is_ok());
        assert!(second.is_err());
    }
}
