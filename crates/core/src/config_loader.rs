use crate::config::AppConfig;
use crate::error::{KeeperError, Result};
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::Path;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/Keeper.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration by merging TOML, environment variables, and JSON.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if files cannot be parsed or validation fails.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from a specific TOML file.
    ///
    /// Environment variables prefixed with `KEEPER_` override file values;
    /// nested keys use `__` (e.g. `KEEPER_MANAGER__TARGET_HEALTH_SCORE`).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if files cannot be parsed or validation fails.
    pub fn load_from(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        let json = path.with_extension("json");
        Self::extract(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed("KEEPER_").split("__"))
                .join(Json::file(json)),
        )
    }

    /// Loads configuration with a profile overlay (`Keeper.<profile>.toml`).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if files cannot be parsed or validation fails.
    pub fn load_with_profile(path: impl AsRef<Path>, profile: &str) -> Result<AppConfig> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Keeper");
        let overlay = path.with_file_name(format!("{stem}.{profile}.toml"));
        Self::extract(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Toml::file(overlay))
                .merge(Env::prefixed("KEEPER_").split("__"))
                .join(Json::file(path.with_extension("json"))),
        )
    }

    fn extract(figment: Figment) -> Result<AppConfig> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| KeeperError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
