//! Config Store
//!
//! Owns `config.json` in the data directory. Saving merges the four
//! managed sections into whatever document is already on disk, so keys
//! added by hand survive a re-conversion. Writes go through a temp file
//! in the same directory and a rename, so readers never see a partial
//! document.

use crate::synth::{pretty_json, ConfigDocument};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// File name inside the data directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Sections the engine requires
pub const REQUIRED_SECTIONS: [&str; 4] = ["log", "inbounds", "outbounds", "routing"];

/// Config errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Please enter a share link or text")]
    EmptyInput,

    #[error("No config to save")]
    Empty,

    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Config is missing the '{0}' section")]
    MissingSection(&'static str),

    #[error("Config has no outbounds")]
    NoOutbounds,

    #[error("Config file is not a JSON object")]
    NotAnObject,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Expected conditions shown to the user as a notice, not a failure
    pub fn is_notice(&self) -> bool {
        matches!(
            self,
            ConfigError::EmptyInput | ConfigError::Empty | ConfigError::NotFound(_)
        )
    }
}

/// Persistent engine document
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Store for `config.json` inside `data_dir`
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self::at(data_dir.as_ref().join(CONFIG_FILE_NAME))
    }

    /// Store for an explicit file path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read the document as a raw JSON object
    pub fn load(&self) -> Result<Map<String, Value>, ConfigError> {
        if !self.exists() {
            return Err(ConfigError::NotFound(self.path.clone()));
        }

        let text = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&text)? {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::NotAnObject),
        }
    }

    /// Read the document and require every engine section plus an outbound
    pub fn load_checked(&self) -> Result<Map<String, Value>, ConfigError> {
        let map = self.load()?;

        for section in REQUIRED_SECTIONS {
            if !map.contains_key(section) {
                return Err(ConfigError::MissingSection(section));
            }
        }
        let has_outbounds = map
            .get("outbounds")
            .and_then(Value::as_array)
            .is_some_and(|o| !o.is_empty());
        if !has_outbounds {
            return Err(ConfigError::NoOutbounds);
        }

        debug!("Loaded config from {}", self.path.display());
        Ok(map)
    }

    /// Pretty-printed document text
    pub fn load_text(&self) -> Result<String, ConfigError> {
        Ok(pretty_json(&self.load()?)?)
    }

    /// Merge `document` into the file on disk
    ///
    /// `None` or a document without outbounds is refused and the file is
    /// left untouched.
    pub fn save(&self, document: Option<&ConfigDocument>) -> Result<(), ConfigError> {
        let document = match document {
            Some(doc) if !doc.is_empty() => doc,
            _ => return Err(ConfigError::Empty),
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut merged = match self.load() {
            Ok(existing) => existing,
            Err(ConfigError::NotFound(_)) => Map::new(),
            Err(e) => return Err(e),
        };
        let Value::Object(fresh) = document.to_value()? else {
            return Err(ConfigError::NotAnObject);
        };
        for (key, value) in fresh {
            merged.insert(key, value);
        }

        self.write_atomic(&Value::Object(merged))?;
        info!(
            "Saved config with {} outbound(s) to {}",
            document.outbounds.len(),
            self.path.display()
        );
        Ok(())
    }

    fn write_atomic(&self, value: &Value) -> Result<(), ConfigError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let text = pretty_json(value)?;
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(text.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
