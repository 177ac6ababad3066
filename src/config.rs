// Settings file: ~/.config/diskpatch/diskpatch.toml and platform equivalents

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE_NAME: &str = "diskpatch.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the vendor boot payloads
    pub payload_dir: Option<PathBuf>,

    /// Tracing filter used when RUST_LOG is unset
    pub log_filter: String,

    /// Also write logs to a file in this directory
    pub log_dir: Option<PathBuf>,

    /// Default for keeping the partition table when writing an MBR image
    pub keep_partition_table: bool,

    /// Take partitions' volumes offline before writing to them
    pub lock_volumes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            payload_dir: None,
            log_filter: "info".to_string(),
            log_dir: None,
            keep_partition_table: true,
            lock_volumes: true,
        }
    }
}

impl Settings {
    /// Default location of the settings file, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "diskpatch", "diskpatch")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Parse settings; keys left out keep their defaults
    pub fn from_toml_content(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse settings")
    }

    /// Load settings from `path`, or the default location when `None`.
    ///
    /// A missing file gives the defaults; an unreadable or malformed one is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => {
                debug!("No config directory on this platform, using defaults");
                return Ok(Self::default());
            }
        };

        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = Self::from_toml_content(&content)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }
}
