//! Preference persistence.
//!
//! Preferences are string values keyed by id, the way the desktop app keeps
//! them. Structured settings such as [`crate::LlmConfig`] are stored as JSON
//! text under their own key.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::widget::{write_json_atomic, StoreError};

/// Key-value preference store.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Stored value for `id`.
    async fn get(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Insert or replace the value for `id`.
    async fn set(&self, id: &str, value: String) -> Result<(), StoreError>;
}

/// Process-local preferences.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    values: DashMap<String, String>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.get(id).map(|v| v.value().clone()))
    }

    async fn set(&self, id: &str, value: String) -> Result<(), StoreError> {
        self.values.insert(id.to_string(), value);
        Ok(())
    }
}

/// Preferences backed by a JSON object on disk.
pub struct JsonFilePreferenceStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFilePreferenceStore {
    /// Open a store. A missing or empty file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = values.len(), "opened preference store");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PreferenceStore for JsonFilePreferenceStore {
    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().await.get(id).cloned())
    }

    async fn set(&self, id: &str, value: String) -> Result<(), StoreError> {
        let mut values = self.values.lock().await;
        let previous = values.insert(id.to_string(), value);
        if let Err(err) = write_json_atomic(&self.path, &*values).await {
            match previous {
                Some(previous) => values.insert(id.to_string(), previous),
                None => values.remove(id),
            };
            return Err(err);
        }
        Ok(())
    }
}
