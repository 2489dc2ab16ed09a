//! Persisted user settings
//!
//! Holds the last endpoint the user chose, under the `proxServer` key of a
//! small JSON file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "proxServer", default, skip_serializing_if = "Option::is_none")]
    pub prox_server: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/tunnelgate/settings.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tunnelgate")
            .join("settings.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means no settings yet.
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings: {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings: {}", self.path.display()))
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write settings: {}", self.path.display()))
    }

    /// Stored endpoint, or `fallback` when none was ever chosen.
    pub fn endpoint_or(&self, fallback: &str) -> Result<String> {
        Ok(self
            .load()?
            .prox_server
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string()))
    }

    pub fn set_endpoint(&self, endpoint: &str) -> Result<()> {
        let mut settings = self.load()?;
        settings.prox_server = Some(endpoint.to_string());
        self.save(&settings)
    }
}
