//! Copy-on-write layer management.
//!
//! Layers are sealed, read-only snapshots registered under their
//! [`LayerKey`]. New layers start life as a [`WritableSnapshot`] cloned from
//! their parent and become layers through [`LayerStore::seal`].
//!
//! The store keeps an in-memory copy of the persisted index so lookups never
//! walk the filesystem. Mutations inside one process are serialized by an
//! internal mutex; callers coordinating several processes hold a
//! [`StoreLock`](crate::StoreLock) and call [`LayerStore::reload`] after
//! acquiring it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use noby_common::{LayerKey, NobyError, NobyPaths, NobyResult, TagName};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::backend::SnapshotBackend;
use crate::digest::tree_digest;
use crate::index::{LayerIndex, LayerRecord};
use crate::tags::TagRegistry;

const PARENT_XATTR: &str = "user.noby.parent";
const INSTRUCTION_XATTR: &str = "user.noby.instruction";

/// A sealed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Index record.
    pub record: LayerRecord,
    /// Snapshot location on disk.
    pub path: PathBuf,
}

impl Layer {
    /// Layer key.
    #[must_use]
    pub fn key(&self) -> &LayerKey {
        &self.record.key
    }

    /// Parent layer key, `None` for layers built on scratch.
    #[must_use]
    pub fn parent(&self) -> Option<&LayerKey> {
        self.record.parent.as_ref()
    }
}

/// A writable snapshot that has not been sealed.
#[derive(Debug)]
#[must_use = "writable snapshots must be sealed or discarded"]
pub struct WritableSnapshot {
    id: String,
    path: PathBuf,
    parent: Option<LayerKey>,
}

impl WritableSnapshot {
    /// Snapshot identifier (directory name).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Root of the snapshot's filesystem.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Layer the snapshot was cloned from.
    #[must_use]
    pub fn parent(&self) -> Option<&LayerKey> {
        self.parent.as_ref()
    }
}

/// What to register a snapshot as.
#[derive(Debug, Clone)]
pub struct SealRequest {
    /// Key to seal under.
    pub key: LayerKey,
    /// Instruction that produced the content.
    pub instruction: String,
    /// Environment the instruction ran with.
    pub env: BTreeMap<String, String>,
}

/// Layer store for managing sealed layers, writable snapshots and tags.
#[derive(Debug)]
pub struct LayerStore {
    paths: NobyPaths,
    backend: Arc<dyn SnapshotBackend>,
    index: RwLock<LayerIndex>,
    tags: RwLock<TagRegistry>,
    /// Serializes check-then-modify sequences within this process.
    mutation: Mutex<()>,
}

impl LayerStore {
    /// Open (or create) the store under `paths`.
    pub fn open(paths: NobyPaths, backend: Arc<dyn SnapshotBackend>) -> NobyResult<Self> {
        paths.create_dirs()?;
        let index = LayerIndex::load(&paths.index_file())?;
        let tags = TagRegistry::open(paths.tags_file())?;

        tracing::debug!(
            root = %paths.root.display(),
            backend = backend.name(),
            layers = index.len(),
            "Layer store opened"
        );

        Ok(Self {
            paths,
            backend,
            index: RwLock::new(index),
            tags: RwLock::new(tags),
            mutation: Mutex::new(()),
        })
    }

    /// Store paths.
    #[must_use]
    pub fn paths(&self) -> &NobyPaths {
        &self.paths
    }

    /// Snapshot backend in use.
    #[must_use]
    pub fn backend(&self) -> &dyn SnapshotBackend {
        self.backend.as_ref()
    }

    /// Re-read the index and the tag registry from disk.
    pub fn reload(&self) -> NobyResult<()> {
        let index = LayerIndex::load(&self.paths.index_file())?;
        *self.index.write() = index;
        self.tags.write().reload()
    }

    /// Look up a sealed layer.
    #[must_use]
    pub fn lookup(&self, key: &LayerKey) -> Option<Layer> {
        self.index.read().get(key).map(|record| self.to_layer(record.clone()))
    }

    /// Get a sealed layer or fail with [`NobyError::LayerNotFound`].
    pub fn layer(&self, key: &LayerKey) -> NobyResult<Layer> {
        self.lookup(key).ok_or_else(|| NobyError::LayerNotFound {
            key: key.to_string(),
        })
    }

    /// All layer records, oldest first.
    #[must_use]
    pub fn list_layers(&self) -> Vec<LayerRecord> {
        let mut records: Vec<_> = self.index.read().records().cloned().collect();
        records.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.key.cmp(&b.key)));
        records
    }

    /// Resolve a tag or a layer key to a sealed layer key.
    #[must_use]
    pub fn resolve_reference(&self, reference: &str) -> Option<LayerKey> {
        if let Some(key) = self.resolve_tag(reference) {
            return Some(key);
        }
        LayerKey::new(reference)
            .ok()
            .filter(|key| self.index.read().contains(key))
    }

    fn to_layer(&self, record: LayerRecord) -> Layer {
        let path = self.paths.layer(&record.key);
        Layer { record, path }
    }

    /// Create a writable snapshot cloned from `parent`, or empty for scratch.
    pub async fn create_child(&self, parent: Option<&LayerKey>) -> NobyResult<WritableSnapshot> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.paths.work().join(&id);

        match parent {
            Some(parent_key) => {
                let parent_layer = self.lookup(parent_key).ok_or_else(|| {
                    NobyError::storage("create", format!("parent layer {parent_key} is missing"))
                })?;
                self.backend.snapshot(&parent_layer.path, &path, false).await?;
            }
            None => self.backend.create_empty(&path).await?,
        }

        tracing::debug!(
            id,
            parent = parent.map(LayerKey::short),
            path = %path.display(),
            "Writable snapshot created"
        );

        Ok(WritableSnapshot {
            id,
            path,
            parent: parent.cloned(),
        })
    }

    /// Create a throwaway writable snapshot atop a sealed layer for a run.
    pub async fn snapshot_for_run(&self, key: &LayerKey) -> NobyResult<WritableSnapshot> {
        let layer = self.layer(key)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.paths.runs().join(&id);

        self.backend.snapshot(&layer.path, &path, false).await?;
        tracing::debug!(id, layer = key.short(), "Run snapshot created");

        Ok(WritableSnapshot {
            id,
            path,
            parent: Some(key.clone()),
        })
    }

    /// Delete a snapshot that will never be sealed.
    pub async fn discard(&self, snapshot: WritableSnapshot) -> NobyResult<()> {
        self.backend.delete(&snapshot.path).await?;
        tracing::debug!(id = snapshot.id, "Writable snapshot discarded");
        Ok(())
    }

    /// Seal a writable snapshot as the layer `request.key`.
    ///
    /// If the key is already registered the snapshot is discarded; the
    /// existing layer is returned when its content digest matches, otherwise
    /// [`NobyError::Conflict`] is returned and the existing layer is left
    /// untouched.
    pub async fn seal(&self, snapshot: WritableSnapshot, request: SealRequest) -> NobyResult<Layer> {
        stamp_metadata(&snapshot, &request.instruction);

        let root = snapshot.path.clone();
        let digest = match tokio::task::spawn_blocking(move || tree_digest(&root)).await {
            Ok(Ok(digest)) => digest,
            Ok(Err(e)) => {
                self.discard(snapshot).await?;
                return Err(e);
            }
            Err(e) => {
                self.discard(snapshot).await?;
                return Err(NobyError::Internal {
                    message: format!("digest task failed: {e}"),
                });
            }
        };

        let _guard = self.mutation.lock().await;

        let existing = self.index.read().get(&request.key).cloned();
        if let Some(existing) = existing {
            self.discard(snapshot).await?;
            if existing.content_digest == digest {
                tracing::debug!(key = request.key.short(), "Layer already sealed with same content");
                return Ok(self.to_layer(existing));
            }
            return Err(NobyError::Conflict {
                key: request.key.to_string(),
                expected: existing.content_digest,
                actual: digest,
            });
        }

        let layer_path = self.paths.layer(&request.key);
        if layer_path.exists() {
            tracing::warn!(
                key = request.key.short(),
                "Replacing layer directory missing from the index"
            );
            if let Err(e) = self.backend.delete(&layer_path).await {
                self.discard(snapshot).await?;
                return Err(e);
            }
        }
        if let Err(e) = self.backend.snapshot(&snapshot.path, &layer_path, true).await {
            self.discard(snapshot).await?;
            return Err(e);
        }

        let record = LayerRecord {
            key: request.key.clone(),
            parent: snapshot.parent.clone(),
            instruction: request.instruction,
            env: request.env,
            content_digest: digest,
            created: Utc::now(),
        };

        let saved = {
            let mut index = self.index.write();
            index.insert(record.clone());
            let saved = index.save(&self.paths.index_file());
            if saved.is_err() {
                index.remove(&request.key);
            }
            saved
        };
        if let Err(e) = saved {
            self.backend.delete(&layer_path).await?;
            self.discard(snapshot).await?;
            return Err(e);
        }

        if let Err(e) = self.discard(snapshot).await {
            tracing::warn!(error = %e, "Failed to remove writable snapshot after sealing");
        }

        tracing::debug!(
            key = request.key.short(),
            parent = record.parent.as_ref().map(LayerKey::short),
            "Layer sealed"
        );
        Ok(self.to_layer(record))
    }

    /// Everything that keeps `key` alive: tags and child layers.
    #[must_use]
    pub fn referrers(&self, key: &LayerKey) -> Vec<String> {
        let mut referrers: Vec<String> = self
            .tags
            .read()
            .referrers(key)
            .map(|tag| format!("tag {tag}"))
            .collect();
        referrers.extend(
            self.index
                .read()
                .children(key)
                .map(|child| format!("layer {}", child.key.short())),
        );
        referrers
    }

    /// Delete a sealed layer that nothing references.
    pub async fn delete_layer(&self, key: &LayerKey) -> NobyResult<()> {
        let _guard = self.mutation.lock().await;
        self.delete_unreferenced(key).await
    }

    async fn delete_unreferenced(&self, key: &LayerKey) -> NobyResult<()> {
        if !self.index.read().contains(key) {
            return Err(NobyError::LayerNotFound {
                key: key.to_string(),
            });
        }

        let referrers = self.referrers(key);
        if !referrers.is_empty() {
            return Err(NobyError::InUse {
                key: key.to_string(),
                referrers,
            });
        }

        self.backend.delete(&self.paths.layer(key)).await?;
        {
            let mut index = self.index.write();
            index.remove(key);
            index.save(&self.paths.index_file())?;
        }

        tracing::info!(key = key.short(), "Layer deleted");
        Ok(())
    }

    /// Delete every layer no tag or child references, until none are left.
    pub async fn collect_garbage(&self) -> NobyResult<Vec<LayerKey>> {
        let _guard = self.mutation.lock().await;
        let mut removed = Vec::new();

        loop {
            let candidates: Vec<LayerKey> = {
                let index = self.index.read();
                let tags = self.tags.read();
                let parents: BTreeSet<&LayerKey> =
                    index.records().filter_map(|r| r.parent.as_ref()).collect();
                index
                    .records()
                    .map(|r| &r.key)
                    .filter(|key| !parents.contains(key) && tags.referrers(key).next().is_none())
                    .cloned()
                    .collect()
            };

            if candidates.is_empty() {
                break;
            }

            for key in candidates {
                self.delete_unreferenced(&key).await?;
                removed.push(key);
            }
        }

        tracing::info!(removed = removed.len(), "Garbage collection finished");
        Ok(removed)
    }

    /// Delete what interrupted builds and runs left behind: writable and run
    /// snapshots, and layer directories that never made it into the index.
    ///
    /// Only safe while holding the exclusive store lock.
    pub async fn reclaim_work(&self) -> NobyResult<usize> {
        let _guard = self.mutation.lock().await;

        let mut leftovers = list_dir(&self.paths.work())?;
        leftovers.extend(list_dir(&self.paths.runs())?);
        {
            let index = self.index.read();
            leftovers.extend(list_dir(&self.paths.layers())?.into_iter().filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| LayerKey::new(name).ok())
                    .is_none_or(|key| !index.contains(&key))
            }));
        }

        for path in &leftovers {
            tracing::warn!(path = %path.display(), "Deleting incomplete snapshot");
            self.backend.delete(path).await?;
        }

        Ok(leftovers.len())
    }

    /// Destroy every layer and snapshot and clear the tag registry.
    pub async fn wipe_all(&self) -> NobyResult<()> {
        let _guard = self.mutation.lock().await;

        for dir in [self.paths.work(), self.paths.runs(), self.paths.layers()] {
            for path in list_dir(&dir)? {
                self.backend.delete(&path).await?;
            }
        }

        {
            let mut index = self.index.write();
            *index = LayerIndex::default();
            index.save(&self.paths.index_file())?;
        }
        self.tags.write().clear()?;

        tracing::info!(root = %self.paths.root.display(), "Store wiped");
        Ok(())
    }

    /// Point a tag at a sealed layer.
    pub async fn set_tag(&self, tag: TagName, key: &LayerKey) -> NobyResult<Option<LayerKey>> {
        let _guard = self.mutation.lock().await;
        if !self.index.read().contains(key) {
            return Err(NobyError::LayerNotFound {
                key: key.to_string(),
            });
        }

        let previous = self.tags.write().set(tag.clone(), key.clone())?;
        tracing::info!(%tag, key = key.short(), "Tag set");
        Ok(previous)
    }

    /// Resolve a tag to its layer key.
    #[must_use]
    pub fn resolve_tag(&self, tag: &str) -> Option<LayerKey> {
        self.tags.read().resolve(tag).cloned()
    }

    /// Remove a tag, returning the layer it pointed at.
    pub async fn delete_tag(&self, tag: &TagName) -> NobyResult<LayerKey> {
        let _guard = self.mutation.lock().await;
        self.tags
            .write()
            .delete(tag)?
            .ok_or_else(|| NobyError::TagNotFound {
                tag: tag.to_string(),
            })
    }

    /// All tags and their targets.
    #[must_use]
    pub fn list_tags(&self) -> Vec<(TagName, LayerKey)> {
        self.tags
            .read()
            .list()
            .map(|(tag, key)| (tag.clone(), key.clone()))
            .collect()
    }
}

/// Record parent and instruction on the snapshot root for inspection with
/// `getfattr`. Filesystems without user xattrs are skipped.
fn stamp_metadata(snapshot: &WritableSnapshot, instruction: &str) {
    use rustix::fs::{XattrFlags, setxattr};

    let parent = snapshot.parent.as_ref().map_or("", LayerKey::as_str);
    for (name, value) in [(PARENT_XATTR, parent), (INSTRUCTION_XATTR, instruction)] {
        if let Err(e) = setxattr(&snapshot.path, name, value.as_bytes(), XattrFlags::empty()) {
            tracing::debug!(name, error = %e, "Skipping layer xattr");
        }
    }
}

fn list_dir(dir: &Path) -> NobyResult<Vec<PathBuf>> {
    let mut entries = Vec::new();
    match std::fs::read_dir(dir) {
        Ok(read_dir) => {
            for entry in read_dir {
                entries.push(entry?.path());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    entries.sort();
    Ok(entries)
}
