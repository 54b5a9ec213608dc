//! Persistence for user settings.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::AppSettings;

/// Durable storage for [`AppSettings`].
pub trait SettingsStore: Send + Sync {
    /// Saved settings, or `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<AppSettings>>;

    fn save(&self, settings: &AppSettings) -> Result<()>;
}

/// Settings stored as pretty-printed JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<Option<AppSettings>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| Error::Settings(format!("reading {}: {e}", self.path.display())))?;
        let settings = serde_json::from_str(&text)
            .map_err(|e| Error::Settings(format!("parsing {}: {e}", self.path.display())))?;
        Ok(Some(settings))
    }

    fn save(&self, settings: &AppSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Settings(format!("creating settings directory {parent:?}: {e}"))
            })?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json)
            .map_err(|e| Error::Settings(format!("writing {}: {e}", self.path.display())))
    }
}
