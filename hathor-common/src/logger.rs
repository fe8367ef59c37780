//! Logging for wallet binaries and tests, built on `tracing`.

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Install the process-wide subscriber: compact stdout lines at INFO and
/// above, with per-target overrides read from `RUST_LOG`.
///
/// Panics if a subscriber is already installed.
pub fn init() {
    try_init().expect("a global tracing subscriber is already set");
}

/// Logging for tests: a no-op unless `RUST_LOG` is set, and tolerant of
/// many test threads racing to install the subscriber.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = try_init();
    }
}

pub fn try_init() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(rust_log_targets())
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
}

/// `RUST_LOG` when present and parseable, INFO-everywhere otherwise.
fn rust_log_targets() -> Targets {
    let everything_info = Targets::new().with_default(Level::INFO);
    match std::env::var("RUST_LOG") {
        Ok(spec) => spec.parse().unwrap_or(everything_info),
        Err(_) => everything_info,
    }
}
