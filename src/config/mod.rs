// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "TCPLB";

/// Load configuration from a file (YAML or JSON), then apply `TCPLB_*` overrides
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let mut config = parse_config(path, &contents)?;

    let overrides = env_overrides().context("Failed to read environment overrides")?;
    overrides.apply(&mut config)?;

    config.validate()?;
    Ok(config)
}

/// Parse a config document, choosing the format from the file extension.
pub fn parse_config(path: &Path, contents: &str) -> Result<Config> {
    let ext = path.extension().and_then(|s| s.to_str());

    let config: Config = if ext == Some("yaml") || ext == Some("yml") {
        serde_yaml::from_str(contents).context("Failed to parse YAML config")?
    } else {
        serde_json::from_str(contents).context("Failed to parse JSON config")?
    };

    Ok(config)
}

fn env_overrides() -> Result<ConfigOverrides, ::config::ConfigError> {
    ::config::Config::builder()
        .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()?
        .try_deserialize()
}
