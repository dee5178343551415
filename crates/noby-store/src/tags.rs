//! Tag registry.
//!
//! Tags are mutable, human-readable names for sealed layers. The registry is
//! a plain persisted map; checks that involve layers (the target must be
//! sealed, tagged layers cannot be collected) live in the
//! [`LayerStore`](crate::LayerStore).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use noby_common::{LayerKey, NobyResult, TagName};
use serde::{Deserialize, Serialize};

use crate::index::{load_json, save_json};

/// Persisted tag to layer key mapping.
#[derive(Debug, Clone)]
pub struct TagRegistry {
    /// Backing file.
    path: PathBuf,
    /// Current mapping.
    tags: BTreeMap<TagName, LayerKey>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TagFile {
    #[serde(default)]
    tags: BTreeMap<TagName, LayerKey>,
}

impl TagRegistry {
    /// Open the registry stored at `path`.
    pub fn open(path: impl Into<PathBuf>) -> NobyResult<Self> {
        let path = path.into();
        let file: TagFile = load_json(&path)?;
        Ok(Self {
            path,
            tags: file.tags,
        })
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the mapping from disk.
    pub fn reload(&mut self) -> NobyResult<()> {
        let file: TagFile = load_json(&self.path)?;
        self.tags = file.tags;
        Ok(())
    }

    fn save(&self) -> NobyResult<()> {
        save_json(
            &self.path,
            &TagFile {
                tags: self.tags.clone(),
            },
        )
    }

    /// Point `tag` at `key`, replacing any previous target.
    ///
    /// Returns the previous target, if any.
    pub fn set(&mut self, tag: TagName, key: LayerKey) -> NobyResult<Option<LayerKey>> {
        let previous = self.tags.insert(tag, key);
        self.save()?;
        Ok(previous)
    }

    /// Resolve a tag.
    #[must_use]
    pub fn resolve(&self, tag: &str) -> Option<&LayerKey> {
        let tag = TagName::new(tag).ok()?;
        self.tags.get(&tag)
    }

    /// Delete a tag, returning its target if it existed.
    pub fn delete(&mut self, tag: &TagName) -> NobyResult<Option<LayerKey>> {
        let removed = self.tags.remove(tag);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// All tags in name order.
    pub fn list(&self) -> impl Iterator<Item = (&TagName, &LayerKey)> {
        self.tags.iter()
    }

    /// Tags pointing at `key`.
    pub fn referrers<'a>(&'a self, key: &'a LayerKey) -> impl Iterator<Item = &'a TagName> {
        self.tags
            .iter()
            .filter(move |(_, target)| *target == key)
            .map(|(name, _)| name)
    }

    /// Remove every tag.
    pub fn clear(&mut self) -> NobyResult<()> {
        self.tags.clear();
        self.save()
    }
}
