use anyhow::Context;
use llm_gateway::{config::GatewayConfig, init_gateway, init_tracing};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line; defaults apply without one
    let config = match env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => GatewayConfig::default_config(),
    };

    init_tracing(&config).context("failed to initialize tracing")?;

    init_gateway(config).await.context("gateway error")?;

    Ok(())
}
