//! Dashboard configuration

use ledger_bindings::EngineConfig;
use ledger_reports::LlmConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Binding cache tuning
    #[serde(default)]
    pub engine: EngineConfig,
    /// LLM settings used until a config is saved to the preference store
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Ledger snapshot (JSON)
    #[serde(default = "default_ledger_path")]
    pub ledger: PathBuf,
    /// Widget store (JSON)
    #[serde(default = "default_widgets_path")]
    pub widgets: PathBuf,
    /// Preference store (JSON)
    #[serde(default = "default_preferences_path")]
    pub preferences: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger: default_ledger_path(),
            widgets: default_widgets_path(),
            preferences: default_preferences_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("ledger.json")
}

fn default_widgets_path() -> PathBuf {
    PathBuf::from("widgets.json")
}

fn default_preferences_path() -> PathBuf {
    PathBuf::from("preferences.json")
}

impl Config {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}
