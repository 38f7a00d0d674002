//! Widget persistence.
//!
//! Dashboard widgets carry a free-form JSON `meta` object. Reports read their
//! settings from it (time frame, name) and write snapshots back into it
//! (`lastAnalysis`, `lastNetWorth`). Updates shallow-merge: top-level keys in
//! the update replace existing ones, everything else is kept.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Widget meta object.
pub type WidgetMeta = Map<String, Json>;

/// Errors from widget stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Widget not found: {0}")]
    NotFound(String),

    #[error("Widget already exists: {0}")]
    AlreadyExists(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A persisted dashboard widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetRecord {
    /// Widget id
    pub id: String,
    /// Widget type, e.g. `net-worth-card` or `ai-analysis-card`
    #[serde(rename = "type")]
    pub widget_type: String,
    /// Free-form settings and snapshots
    #[serde(default)]
    pub meta: WidgetMeta,
}

impl WidgetRecord {
    pub fn new(id: impl Into<String>, widget_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            widget_type: widget_type.into(),
            meta: Map::new(),
        }
    }

    /// A new widget with a generated id.
    pub fn create(widget_type: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), widget_type)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Json) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Deserialize one meta key, `None` when absent or malformed.
    pub fn meta_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.meta.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn merge(&mut self, update: WidgetMeta) {
        for (key, value) in update {
            self.meta.insert(key, value);
        }
    }
}

/// Widget persistence store.
#[async_trait]
pub trait WidgetStore: Send + Sync {
    /// Fetch a widget.
    async fn get(&self, widget_id: &str) -> Result<Option<WidgetRecord>, StoreError>;

    /// Shallow-merge `meta` into an existing widget and return the result.
    async fn update(&self, widget_id: &str, meta: WidgetMeta) -> Result<WidgetRecord, StoreError>;

    /// Add a new widget.
    async fn insert(&self, record: WidgetRecord) -> Result<(), StoreError>;

    /// All widgets, ordered by id.
    async fn list(&self) -> Result<Vec<WidgetRecord>, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store.
#[derive(Default)]
pub struct MemoryWidgetStore {
    widgets: DashMap<String, WidgetRecord>,
}

impl MemoryWidgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_widgets(widgets: impl IntoIterator<Item = WidgetRecord>) -> Self {
        let store = Self::new();
        for widget in widgets {
            store.widgets.insert(widget.id.clone(), widget);
        }
        store
    }
}

#[async_trait]
impl WidgetStore for MemoryWidgetStore {
    async fn get(&self, widget_id: &str) -> Result<Option<WidgetRecord>, StoreError> {
        Ok(self.widgets.get(widget_id).map(|w| w.value().clone()))
    }

    async fn update(&self, widget_id: &str, meta: WidgetMeta) -> Result<WidgetRecord, StoreError> {
        let mut entry = self
            .widgets
            .get_mut(widget_id)
            .ok_or_else(|| StoreError::NotFound(widget_id.to_string()))?;
        entry.merge(meta);
        Ok(entry.value().clone())
    }

    async fn insert(&self, record: WidgetRecord) -> Result<(), StoreError> {
        match self.widgets.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn list(&self) -> Result<Vec<WidgetRecord>, StoreError> {
        let mut widgets: Vec<_> = self.widgets.iter().map(|w| w.value().clone()).collect();
        widgets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(widgets)
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// Store backed by a JSON array on disk.
///
/// The whole file is rewritten on every change: written to a sibling temp
/// file, then renamed over the original.
pub struct JsonFileWidgetStore {
    path: PathBuf,
    widgets: Mutex<BTreeMap<String, WidgetRecord>>,
}

impl JsonFileWidgetStore {
    /// Open a store. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let widgets = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => {
                let records: Vec<WidgetRecord> = serde_json::from_str(&text)?;
                records.into_iter().map(|w| (w.id.clone(), w)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = widgets.len(), "opened widget store");
        Ok(Self {
            path,
            widgets: Mutex::new(widgets),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, widgets: &BTreeMap<String, WidgetRecord>) -> Result<(), StoreError> {
        let records: Vec<&WidgetRecord> = widgets.values().collect();
        write_json_atomic(&self.path, &records).await
    }
}

/// Write `value` as pretty JSON to a sibling temp file, then rename it over
/// `path`.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;

    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl WidgetStore for JsonFileWidgetStore {
    async fn get(&self, widget_id: &str) -> Result<Option<WidgetRecord>, StoreError> {
        Ok(self.widgets.lock().await.get(widget_id).cloned())
    }

    async fn update(&self, widget_id: &str, meta: WidgetMeta) -> Result<WidgetRecord, StoreError> {
        let mut widgets = self.widgets.lock().await;
        let mut record = widgets
            .get(widget_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(widget_id.to_string()))?;
        record.merge(meta);

        let previous = widgets.insert(widget_id.to_string(), record.clone());
        if let Err(err) = self.persist(&widgets).await {
            // Keep memory in step with disk.
            if let Some(previous) = previous {
                widgets.insert(widget_id.to_string(), previous);
            }
            return Err(err);
        }
        Ok(record)
    }

    async fn insert(&self, record: WidgetRecord) -> Result<(), StoreError> {
        let mut widgets = self.widgets.lock().await;
        if widgets.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        let id = record.id.clone();
        widgets.insert(id.clone(), record);
        if let Err(err) = self.persist(&widgets).await {
            widgets.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WidgetRecord>, StoreError> {
        Ok(self.widgets.lock().await.values().cloned().collect())
    }
}
