//! The build engine: one store, one executor, every operation.
//!
//! Each mutating operation takes the exclusive store lock for its whole
//! duration and re-reads the persisted index first, so engines in different
//! processes can share a store root.

use std::path::Path;
use std::sync::Arc;

use noby_common::{LayerKey, NobyError, NobyPaths, NobyResult, TagName};
use noby_store::{LayerRecord, LayerStore, LockMode, SnapshotBackend, StoreLock};

use crate::build::{BuildOptions, BuildReport, Builder};
use crate::config::EngineConfig;
use crate::env::{self, EnvSet};
use crate::exec::CommandExecutor;
use crate::nobyfile::BuildPlan;
use crate::run::{RunOutcome, RunService};

/// Entry point for builds, runs and store maintenance.
#[derive(Debug)]
pub struct Engine {
    store: LayerStore,
    executor: Arc<dyn CommandExecutor>,
}

impl Engine {
    /// Open the store described by `config` with the process executor.
    pub fn open(config: &EngineConfig) -> NobyResult<Self> {
        config.paths.create_dirs()?;
        let backend = config.backend.open(&config.paths.root)?;
        Self::with_parts(config.paths.clone(), backend, Arc::new(config.executor()))
    }

    /// Assemble an engine from explicit parts.
    pub fn with_parts(
        paths: NobyPaths,
        backend: Arc<dyn SnapshotBackend>,
        executor: Arc<dyn CommandExecutor>,
    ) -> NobyResult<Self> {
        let store = LayerStore::open(paths, backend)?;
        tracing::debug!(
            root = %store.paths().root.display(),
            backend = store.backend().name(),
            "Engine ready"
        );
        Ok(Self { store, executor })
    }

    /// The layer store.
    #[must_use]
    pub const fn store(&self) -> &LayerStore {
        &self.store
    }

    /// Build `plan` in `context`, then point `tag` at the final layer.
    ///
    /// A scratch plan without `HOST` or `RUN` instructions produces no layer;
    /// the report's final key is `None` and no tag is set.
    pub async fn build(
        &self,
        plan: &BuildPlan,
        context: &Path,
        overrides: &EnvSet,
        tag: Option<&TagName>,
        options: BuildOptions,
    ) -> NobyResult<BuildReport> {
        let _lock = self.lock(LockMode::Exclusive, "build").await?;
        self.store.reload()?;

        let reclaimed = self.store.reclaim_work().await?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Removed snapshots of interrupted builds");
        }

        let env = env::resolve(plan, overrides);
        tracing::info!(
            context = %context.display(),
            instructions = plan.instructions().len(),
            layers = plan.layer_count(),
            "Starting build"
        );

        let mut builder = Builder::new(
            &self.store,
            self.executor.as_ref(),
            plan,
            context,
            env,
            options,
        );
        let mut report = builder.execute().await?;

        match (&report.final_key, tag) {
            (Some(key), Some(tag)) => {
                self.store.set_tag(tag.clone(), key).await?;
                report.tag = Some(tag.clone());
            }
            (None, Some(tag)) => {
                tracing::warn!(%tag, "Build produced no layer, not tagging");
            }
            _ => {}
        }

        tracing::info!(
            final_key = report.final_key.as_ref().map(LayerKey::short),
            reused = report.reused(),
            created = report.created(),
            "Build finished"
        );
        Ok(report)
    }

    /// Run `command` in a throwaway snapshot of the layer `reference` names.
    pub async fn run(&self, reference: &str, command: &str) -> NobyResult<RunOutcome> {
        RunService::new(&self.store, self.executor.as_ref())
            .run(reference, command)
            .await
    }

    /// Destroy every layer, snapshot and tag.
    pub async fn wipe(&self) -> NobyResult<()> {
        let _lock = self.lock(LockMode::Exclusive, "wipe").await?;
        self.store.reload()?;
        self.store.wipe_all().await
    }

    /// All tags and their layers, sorted by name.
    pub fn list_tags(&self) -> NobyResult<Vec<(TagName, LayerKey)>> {
        self.store.reload()?;
        Ok(self.store.list_tags())
    }

    /// Point `tag` at the layer `reference` names (a tag or a layer key).
    pub async fn tag(&self, tag: &TagName, reference: &str) -> NobyResult<LayerKey> {
        let _lock = self.lock(LockMode::Exclusive, "tag").await?;
        self.store.reload()?;

        let key = self
            .store
            .resolve_reference(reference)
            .ok_or_else(|| NobyError::LayerNotFound {
                key: reference.to_string(),
            })?;
        self.store.set_tag(tag.clone(), &key).await?;
        Ok(key)
    }

    /// Remove `tag`, returning the layer it pointed at.
    pub async fn untag(&self, tag: &TagName) -> NobyResult<LayerKey> {
        let _lock = self.lock(LockMode::Exclusive, "untag").await?;
        self.store.reload()?;
        self.store.delete_tag(tag).await
    }

    /// All layers, oldest first.
    pub fn list_layers(&self) -> NobyResult<Vec<LayerRecord>> {
        self.store.reload()?;
        Ok(self.store.list_layers())
    }

    /// Delete a layer nothing references.
    pub async fn delete_layer(&self, key: &LayerKey) -> NobyResult<()> {
        let _lock = self.lock(LockMode::Exclusive, "rmi").await?;
        self.store.reload()?;
        self.store.delete_layer(key).await
    }

    /// Delete every layer no tag keeps alive.
    pub async fn collect_garbage(&self) -> NobyResult<Vec<LayerKey>> {
        let _lock = self.lock(LockMode::Exclusive, "gc").await?;
        self.store.reload()?;
        self.store.collect_garbage().await
    }

    async fn lock(&self, mode: LockMode, command: &str) -> NobyResult<StoreLock> {
        let paths = self.store.paths();
        match StoreLock::try_acquire(paths, mode, command) {
            Err(NobyError::Locked { holder }) => {
                tracing::info!(%holder, "Waiting for store lock");
                StoreLock::acquire_async(paths, mode, command).await
            }
            result => result,
        }
    }
}
