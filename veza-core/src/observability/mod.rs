//! Observability: tracing subscriber and metric descriptions.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Install the global tracing subscriber and describe metrics.
///
/// `RUST_LOG` wins over `default_level` (the configured `log_level`).
/// Output goes to stderr so command output on stdout stays machine-readable.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).with_level(true))
        .try_init()?;

    metrics::register_core_metrics();
    tracing::debug!(level = default_level, "Observability initialized");
    Ok(())
}
