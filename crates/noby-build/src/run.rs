//! Running commands in throwaway snapshots of built layers.

use std::path::PathBuf;

use noby_common::{NobyError, NobyResult};
use noby_store::{LayerStore, LockMode, StoreLock};

use crate::exec::{CommandExecutor, ExecutionMode, Invocation};

/// Result of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code, `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RunOutcome {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes commands inside snapshots of tagged layers.
#[derive(Debug)]
pub struct RunService<'a> {
    store: &'a LayerStore,
    executor: &'a dyn CommandExecutor,
}

impl<'a> RunService<'a> {
    /// Create a run service over `store`.
    pub fn new(store: &'a LayerStore, executor: &'a dyn CommandExecutor) -> Self {
        Self { store, executor }
    }

    /// Run `command` in a fresh snapshot of the layer `reference` names.
    ///
    /// The shared store lock is held until the snapshot is gone, so a wipe
    /// or a build's cleanup never pulls the root out from under a running
    /// command. The snapshot is deleted afterwards whatever the outcome. A
    /// non-zero exit status is reported in the outcome, not as an error.
    pub async fn run(&self, reference: &str, command: &str) -> NobyResult<RunOutcome> {
        let _lock = StoreLock::acquire_async(self.store.paths(), LockMode::Shared, "run").await?;
        self.store.reload()?;

        let key = self
            .store
            .resolve_reference(reference)
            .ok_or_else(|| NobyError::TagNotFound {
                tag: reference.to_string(),
            })?;
        let env = self.store.layer(&key)?.record.env;
        let snapshot = self.store.snapshot_for_run(&key).await?;

        tracing::info!(reference, id = snapshot.id(), command, "Running command");

        let invocation = Invocation {
            mode: ExecutionMode::Sandbox,
            command: command.to_string(),
            root: snapshot.path().to_path_buf(),
            workdir: PathBuf::from("/"),
            env,
        };
        let result = self.executor.execute(&invocation).await;

        if let Err(e) = self.store.discard(snapshot).await {
            tracing::warn!(error = %e, "Failed to delete run snapshot");
        }

        let output = result.map_err(|e| NobyError::Execution {
            index: 0,
            line: None,
            command: command.to_string(),
            exit_code: None,
            message: e.to_string(),
        })?;

        tracing::info!(exit_code = ?output.exit_code, "Run finished");
        Ok(RunOutcome {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io;
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use noby_common::{LayerKey, NobyPaths, TagName};
    use noby_store::{DirectoryBackend, SealRequest};

    use super::*;
    use crate::exec::ExecOutput;

    /// Reports whether a wipe could take the store lock while the command runs.
    #[derive(Debug)]
    struct LockWitness {
        paths: NobyPaths,
    }

    #[async_trait]
    impl CommandExecutor for LockWitness {
        async fn execute(&self, invocation: &Invocation) -> io::Result<ExecOutput> {
            let blocked = matches!(
                StoreLock::try_acquire(&self.paths, LockMode::Exclusive, "wipe"),
                Err(NobyError::Locked { .. })
            );
            Ok(ExecOutput {
                exit_code: Some(0),
                stdout: format!("blocked={blocked} root={}", invocation.root.exists()),
                ..ExecOutput::default()
            })
        }
    }

    async fn tagged_store(root: &Path) -> LayerStore {
        let store =
            LayerStore::open(NobyPaths::with_root(root), Arc::new(DirectoryBackend)).unwrap();
        let key = LayerKey::new("a".repeat(64)).unwrap();
        let snapshot = store.create_child(None).await.unwrap();
        store
            .seal(
                snapshot,
                SealRequest {
                    key: key.clone(),
                    instruction: "RUN true".to_string(),
                    env: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        store.set_tag(TagName::new("app").unwrap(), &key).await.unwrap();
        store
    }

    #[tokio::test]
    async fn store_stays_locked_while_command_runs() {
        let temp = tempfile::tempdir().unwrap();
        let store = tagged_store(temp.path()).await;
        let executor = LockWitness {
            paths: store.paths().clone(),
        };

        let outcome = RunService::new(&store, &executor)
            .run("app", "true")
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "blocked=true root=true");
        assert_eq!(std::fs::read_dir(store.paths().runs()).unwrap().count(), 0);
        let _lock = StoreLock::try_acquire(store.paths(), LockMode::Exclusive, "wipe").unwrap();
    }
}
