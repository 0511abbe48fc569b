//! Persisted CLI configuration: the authentication token.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub token: String,
}

pub fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".portico").join("config.json"))
}

/// Load the saved configuration; a missing file is an empty config.
pub fn load() -> Result<CliConfig> {
    load_from(&config_path()?)
}

fn load_from(path: &PathBuf) -> Result<CliConfig> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data)
            .with_context(|| format!("invalid config file {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CliConfig::default()),
        Err(err) => Err(err).with_context(|| format!("could not read {}", path.display())),
    }
}

/// Write the configuration, creating the directory and restricting the file
/// to the current user (it holds the token).
pub fn save(config: &CliConfig) -> Result<PathBuf> {
    let path = config_path()?;
    save_to(config, &path)?;
    Ok(path)
}

fn save_to(config: &CliConfig, path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("could not create {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(config)?;
    fs::write(path, data).with_context(|| format!("could not write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
