use anyhow::anyhow;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a console subscriber for the pipeline's `tracing` events.
///
/// The filter comes from `RUST_LOG` when set, `default_filter` otherwise
/// (e.g. `"volume_loader=debug"`). Fails when the filter does not parse or a
/// global subscriber is already installed.
pub fn init_logging(default_filter: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| anyhow!("Invalid log filter {:?}: {}", default_filter, e))?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow!("Logger initialization failed: {}", e))
}
