//! `grantwell serve`: Start the HTTP API server.

use anyhow::Context;
use grantwell_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load config")?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Grantwell Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.model);
    println!("   Storage:   {}", config.storage.backend);

    grantwell_gateway::start(config).await?;

    Ok(())
}
