//! Reasoning engine implementations for Grantwell.
//!
//! All providers implement the `grantwell_core::Provider` trait.

pub mod anthropic;
pub mod sse;

pub use anthropic::AnthropicProvider;

use grantwell_config::AppConfig;
use grantwell_core::Provider;
use grantwell_core::error::ProviderError;
use std::sync::Arc;

/// Build the configured reasoning engine.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = config.api_key.clone().ok_or_else(|| {
        ProviderError::NotConfigured(
            "no API key; set GRANTWELL_API_KEY or api_key in config.toml".into(),
        )
    })?;

    let mut provider = AnthropicProvider::new(api_key, config.provider.timeout_secs)?
        .with_base_url(&config.provider.base_url);
    if let Some(budget) = config.provider.thinking_budget {
        provider = provider.with_extended_thinking(budget);
    }
    Ok(Arc::new(provider))
}
