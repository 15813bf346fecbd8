//! `grantwell config`: Configuration commands.

use anyhow::Context;
use grantwell_config::AppConfig;

pub fn show() -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load config")?;
    if config.api_key.is_some() {
        config.api_key = Some("[REDACTED]".into());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}
