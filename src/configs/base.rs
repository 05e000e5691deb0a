use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{common::types::AnyResult, configs::*};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub youtube: YouTubeConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

impl Config {
    /// Reads `config.toml`, falling back to `config.default.toml`.
    pub fn load() -> AnyResult<Self> {
        let config_path = ["config.toml", "config.default.toml"]
            .into_iter()
            .find(|p| Path::new(p).exists())
            .ok_or("config.toml or config.default.toml not found")?;

        crate::log_println!("Loading configuration from: {}", config_path);

        let raw = std::fs::read_to_string(config_path)?;
        if raw.trim().is_empty() {
            return Err(format!("{} is empty", config_path).into());
        }
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> AnyResult<Self> {
        let config: Config = toml::from_str(raw)?;
        if config.player.timestamp_modulus == 0 || config.player.timestamp_modulus > 1 << 32 {
            return Err("player.timestamp_modulus must be within 1..=2^32".into());
        }
        if config.player.cipher_modes.is_empty() {
            return Err("player.cipher_modes must list at least one mode".into());
        }
        Ok(config)
    }
}
