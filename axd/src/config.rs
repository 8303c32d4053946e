//! Volume table configuration.
//!
//! The agent exports host directories to the peer as named volumes. The
//! table comes from a small TOML file:
//!
//! ```toml
//! [[volume]]
//! name = "Work"
//! path = "/srv/amiga/work"
//!
//! [[volume]]
//! name = "Backup"
//! path = "/srv/amiga/backup"
//! ```
//!
//! Without a config file the current directory is exported as a single
//! volume named `Work`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default, rename = "volume")]
    pub volumes: Vec<VolumeConfig>,
}

/// One exported volume.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    pub path: PathBuf,
}

impl Config {
    /// Loads and parses a config file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        if config.volumes.is_empty() {
            bail!("config file {} exports no volumes", path.display());
        }
        Ok(config)
    }

    /// The fallback configuration: the current directory as `Work`.
    pub fn default_export() -> Result<Config> {
        let cwd = env::current_dir().context("cannot determine current directory")?;
        Ok(Config {
            volumes: vec![VolumeConfig {
                name: "Work".into(),
                path: cwd,
            }],
        })
    }
}
