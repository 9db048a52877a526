mod check_config;
mod run;

pub use check_config::check_config;
pub use run::{run, RunArgs};

use std::path::Path;

use anyhow::Context;
use comet_keeper_core::{AppConfig, ConfigLoader};

fn load_config(path: &Path, profile: Option<&str>) -> anyhow::Result<AppConfig> {
    let config = match profile {
        Some(profile) => ConfigLoader::load_with_profile(path, profile),
        None => ConfigLoader::load_from(path),
    };
    config.with_context(|| format!("Failed to load config from {}", path.display()))
}
