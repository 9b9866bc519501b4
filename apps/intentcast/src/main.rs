//! Intentcast broadcaster entry point.

mod app;
mod config;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = config::Config::load()?;

    // RUST_LOG wins over the config file.
    let default_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        source = intentcast_protocol::source_address(),
        "starting Intentcast broadcaster"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, CancellationToken::new()))?;

    tracing::info!("broadcaster shut down cleanly");
    Ok(())
}
