//! Persisted layer index.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use noby_common::{LayerKey, NobyError, NobyResult};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Everything known about a sealed layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Layer key.
    pub key: LayerKey,
    /// Parent layer key, `None` for layers built on scratch.
    pub parent: Option<LayerKey>,
    /// Instruction that produced the layer (e.g. `RUN make install`).
    pub instruction: String,
    /// Environment the instruction ran with.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Content digest of the sealed tree.
    pub content_digest: String,
    /// Creation time.
    pub created: DateTime<Utc>,
}

/// Layer key to record mapping, persisted as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerIndex {
    #[serde(default)]
    layers: BTreeMap<LayerKey, LayerRecord>,
}

impl LayerIndex {
    /// Load the index, returning an empty one if the file does not exist.
    pub fn load(path: &Path) -> NobyResult<Self> {
        load_json(path)
    }

    /// Persist the index atomically.
    pub fn save(&self, path: &Path) -> NobyResult<()> {
        save_json(path, self)
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, key: &LayerKey) -> Option<&LayerRecord> {
        self.layers.get(key)
    }

    /// Whether `key` is indexed.
    #[must_use]
    pub fn contains(&self, key: &LayerKey) -> bool {
        self.layers.contains_key(key)
    }

    /// Insert or replace a record.
    pub fn insert(&mut self, record: LayerRecord) {
        self.layers.insert(record.key.clone(), record);
    }

    /// Remove a record.
    pub fn remove(&mut self, key: &LayerKey) -> Option<LayerRecord> {
        self.layers.remove(key)
    }

    /// Layers whose parent is `key`.
    pub fn children<'a>(&'a self, key: &'a LayerKey) -> impl Iterator<Item = &'a LayerRecord> {
        self.layers
            .values()
            .filter(move |record| record.parent.as_ref() == Some(key))
    }

    /// All records in key order.
    pub fn records(&self) -> impl Iterator<Item = &LayerRecord> {
        self.layers.values()
    }

    /// Number of indexed layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Read a JSON document, defaulting when the file is missing.
pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> NobyResult<T> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map_err(|e| {
            NobyError::Serialization(format!("failed to parse {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON document through a temporary file and rename.
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> NobyResult<()> {
    let dir = path.parent().ok_or_else(|| NobyError::Internal {
        message: format!("{} has no parent directory", path.display()),
    })?;

    let content = serde_json::to_string_pretty(value)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| NobyError::Io(e.error))?;
    Ok(())
}
