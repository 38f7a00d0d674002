//! LLM settings and connection testing.
//!
//! `LlmConfig` is the saved preference that decides which backend the
//! analysis report talks to. It serializes with camelCase keys, so a config
//! saved by the desktop settings screen loads unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::{LlmBackend, LlmError, OpenAiBackend};
use crate::preferences::PreferenceStore;
use crate::widget::StoreError;

/// Preference key the config is stored under.
pub const PREFERENCE_KEY: &str = "llmConfig";

/// LLM provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Anthropic,
    Custom,
    Ollama,
}

impl LlmProvider {
    /// Base URL used when the config leaves it empty.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            LlmProvider::OpenAi => Some("https://api.openai.com/v1"),
            LlmProvider::Anthropic => Some("https://api.anthropic.com/v1"),
            LlmProvider::Ollama => Some("http://localhost:11434/v1"),
            LlmProvider::Custom => None,
        }
    }

    /// Model used when the config leaves it empty.
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi | LlmProvider::Custom => "gpt-4",
            LlmProvider::Anthropic => "claude-3-5-sonnet-latest",
            LlmProvider::Ollama => "llama3.2",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Custom => "custom",
            LlmProvider::Ollama => "ollama",
        };
        f.write_str(name)
    }
}

/// Saved LLM settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Which API family to talk to
    #[serde(default)]
    pub provider: LlmProvider,
    /// Bearer key; may be empty for local servers
    #[serde(default, alias = "api_key")]
    pub api_key: String,
    /// Model name (provider default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// API base URL (provider default when unset)
    #[serde(default, alias = "base_url", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Analysis is only offered when enabled
    #[serde(default)]
    pub enabled: bool,
    /// When the last successful connection test ran
    #[serde(default, alias = "last_tested", skip_serializing_if = "Option::is_none")]
    pub last_tested: Option<DateTime<Utc>>,
}

impl LlmConfig {
    /// An enabled config for the given provider and key.
    pub fn new(provider: LlmProvider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Parse from the stored JSON preference value.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Effective model name. Empty strings count as unset.
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.provider.default_model())
    }

    /// Effective base URL. Empty strings count as unset.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| self.provider.default_base_url())
    }

    /// Build the backend this config describes.
    pub fn backend(&self) -> Result<Arc<dyn LlmBackend>, LlmError> {
        if !self.enabled {
            return Err(LlmError::Unavailable("LLM analysis is disabled".to_string()));
        }
        let backend = self.http_backend()?;
        Ok(Arc::new(backend))
    }

    fn http_backend(&self) -> Result<OpenAiBackend, LlmError> {
        let base_url = self
            .base_url()
            .ok_or_else(|| LlmError::Unavailable(format!("provider {} requires a base URL", self.provider)))?;
        OpenAiBackend::new(base_url, self.model(), Some(self.api_key.clone()))
    }

    /// Record a connection test; only successful tests update `last_tested`.
    pub fn record_test(&mut self, result: &ConnectionTestResult) {
        if result.success {
            self.last_tested = Some(result.timestamp);
        }
    }
}

/// Saved LLM settings, `None` when nothing was saved.
///
/// A stored value that no longer parses is logged and treated as unsaved.
pub async fn load_llm_config(prefs: &dyn PreferenceStore) -> Result<Option<LlmConfig>, StoreError> {
    let Some(json) = prefs.get(PREFERENCE_KEY).await? else {
        return Ok(None);
    };
    match LlmConfig::from_json(&json) {
        Ok(config) => Ok(Some(config)),
        Err(err) => {
            warn!(error = %err, "ignoring unreadable saved LLM config");
            Ok(None)
        }
    }
}

/// Save LLM settings, replacing any saved before.
pub async fn save_llm_config(prefs: &dyn PreferenceStore, config: &LlmConfig) -> Result<(), StoreError> {
    prefs.set(PREFERENCE_KEY, config.to_json()?).await?;
    info!(provider = %config.provider, enabled = config.enabled, "saved LLM config");
    Ok(())
}

/// Outcome of [`test_connection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionTestResult {
    fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Test `GET {base}/models` with the configured key.
///
/// Never fails: every outcome becomes a result with a user-facing message.
pub async fn test_connection(config: Option<&LlmConfig>) -> ConnectionTestResult {
    let Some(config) = config else {
        return ConnectionTestResult::new(false, "No configuration available to test");
    };

    let backend = match config.http_backend() {
        Ok(backend) => backend,
        Err(err) => return ConnectionTestResult::new(false, format!("Connection error: {}", err)),
    };

    let result = match backend.list_models().await {
        Ok(()) => ConnectionTestResult::new(true, "Connection successful"),
        Err(err @ LlmError::Api { .. }) => ConnectionTestResult::new(false, err.to_string()),
        Err(LlmError::NetworkError(msg)) => ConnectionTestResult::new(false, format!("Connection error: {}", msg)),
        Err(err) => ConnectionTestResult::new(false, format!("Connection error: {}", err)),
    };

    if result.success {
        info!(provider = %config.provider, "LLM connection test succeeded");
    } else {
        warn!(provider = %config.provider, message = %result.message, "LLM connection test failed");
    }
    result
}
