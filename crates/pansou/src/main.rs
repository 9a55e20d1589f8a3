//! The pansou server binary: load config, wire logging, enumerate the
//! built-in plugins, serve.

use std::sync::Arc;

use tracing::info;

use pansou_runtime::{config::AppConfig, logging, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    logging::init_from_config(&config.logging);

    let registry = Arc::new(pansou_plugins::builtin_registry()?);
    info!(
        plugins = registry.len(),
        auth_enabled = config.auth.enabled,
        "starting pansou"
    );

    server::serve(registry, config).await?;
    Ok(())
}
