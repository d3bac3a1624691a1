//! Application settings (`tunlink.toml`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tunlink_session::SessionSettings;

/// Settings file looked up in the working directory
pub const DEFAULT_SETTINGS_FILE: &str = "tunlink.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Holds `config.json` and the routing assets
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where `geosite.dat` and `geoip.dat` are copied from
    #[serde(default)]
    pub assets_dir: Option<PathBuf>,

    #[serde(default = "default_engine_binary")]
    pub engine_binary: PathBuf,

    #[serde(default = "default_bridge_binary")]
    pub bridge_binary: PathBuf,

    #[serde(default)]
    pub session: SessionSettings,
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/tunlink"),
        None => PathBuf::from("tunlink-data"),
    }
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("xray")
}

fn default_bridge_binary() -> PathBuf {
    PathBuf::from("tun2proxy-bin")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            assets_dir: None,
            engine_binary: default_engine_binary(),
            bridge_binary: default_bridge_binary(),
            session: SessionSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid settings {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path`, or `tunlink.toml` if present, or defaults
    ///
    /// An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_toml_file(path);
        }

        let fallback = Path::new(DEFAULT_SETTINGS_FILE);
        if fallback.is_file() {
            Self::from_toml_file(fallback)
        } else {
            info!("No {} found, using default settings", DEFAULT_SETTINGS_FILE);
            Ok(Self::default())
        }
    }
}
