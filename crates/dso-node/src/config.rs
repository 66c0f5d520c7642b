//! Configuration file parsing for dso.toml.

use dso_client::{ClientConfig, ServerMapConfig};
use dso_server::ObjectManagerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DsoConfig {
    /// Object manager and DGC settings
    #[serde(default)]
    pub server: ObjectManagerConfig,

    /// Client object manager settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Server map local cache settings
    #[serde(default)]
    pub map: ServerMapConfig,
}

/// Load configuration from an explicit file, else from the nearest
/// `dso.toml` / `.dsorc.toml` above the working directory, else defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<DsoConfig> {
    let config_path = match path {
        Some(path) if !path.exists() => {
            anyhow::bail!("Config file {} does not exist", path.display())
        }
        Some(path) => Some(path.to_path_buf()),
        None => std::env::current_dir()
            .ok()
            .and_then(|cwd| find_config_file(&cwd)),
    };

    match config_path {
        Some(path) => parse_config_file(&path),
        None => Ok(DsoConfig::default()),
    }
}

fn parse_config_file(path: &Path) -> anyhow::Result<DsoConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: DsoConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
    tracing::debug!(target: "dso::node", path = %path.display(), "loaded config");
    Ok(config)
}

/// Search for a configuration file in `start` and its ancestors.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    // Config file names to search for
    const CONFIG_NAMES: &[&str] = &["dso.toml", ".dsorc.toml"];

    let mut dir = Some(start);
    while let Some(current) = dir {
        for name in CONFIG_NAMES {
            let path = current.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        dir = current.parent();
    }
    None
}
