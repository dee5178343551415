//! Layered build execution.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use noby_common::{LayerKey, NobyError, NobyResult, SCRATCH, TagName};
use noby_store::{LayerStore, SealRequest};

use crate::cache::layer_key;
use crate::env::EnvSet;
use crate::exec::{CommandExecutor, ExecOutput, ExecutionMode, Invocation};
use crate::nobyfile::{BuildPlan, Instruction};

/// Where a build currently stands.
///
/// `None` in [`BuildState::Resolved`] and [`BuildState::Done`] stands for
/// `scratch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildState {
    /// About to process the instruction at this index.
    Pending(usize),
    /// The chain so far ends at this layer.
    Resolved(Option<LayerKey>),
    /// The build stopped with this error message.
    Failed(String),
    /// Every instruction was processed.
    Done(Option<LayerKey>),
}

/// Build options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Set to stop the build before the next instruction starts.
    pub abort: Arc<AtomicBool>,
}

impl BuildOptions {
    /// Handle that aborts the build when set.
    #[must_use]
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }
}

/// How a step's layer was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Existing layer reused.
    Cached,
    /// Command executed and a new layer sealed.
    Built,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached => write!(f, "cached"),
            Self::Built => write!(f, "built"),
        }
    }
}

/// One layer-producing instruction of a finished build.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Index of the instruction within the plan.
    pub index: usize,
    /// Instruction text.
    pub instruction: String,
    /// Layer the step produced.
    pub key: LayerKey,
    /// Layer the step started from.
    pub parent: Option<LayerKey>,
    /// Cache hit or fresh build.
    pub outcome: StepOutcome,
    /// Captured command output, for built steps.
    pub output: Option<ExecOutput>,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Final layer, `None` when a scratch plan had nothing to execute.
    pub final_key: Option<LayerKey>,
    /// Layer-producing steps in order.
    pub steps: Vec<StepRecord>,
    /// Tag pointed at the final layer.
    pub tag: Option<TagName>,
}

impl BuildReport {
    /// Number of reused layers.
    #[must_use]
    pub fn reused(&self) -> usize {
        self.count(StepOutcome::Cached)
    }

    /// Number of newly created layers.
    #[must_use]
    pub fn created(&self) -> usize {
        self.count(StepOutcome::Built)
    }

    fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

/// Drives one build plan through the layer store.
#[derive(Debug)]
pub struct Builder<'a> {
    store: &'a LayerStore,
    executor: &'a dyn CommandExecutor,
    plan: &'a BuildPlan,
    context: &'a Path,
    env: EnvSet,
    options: BuildOptions,
    state: BuildState,
}

impl<'a> Builder<'a> {
    /// Create a builder for `plan` with the resolved environment `env`.
    pub fn new(
        store: &'a LayerStore,
        executor: &'a dyn CommandExecutor,
        plan: &'a BuildPlan,
        context: &'a Path,
        env: EnvSet,
        options: BuildOptions,
    ) -> Self {
        Self {
            store,
            executor,
            plan,
            context,
            env,
            options,
            state: BuildState::Pending(0),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &BuildState {
        &self.state
    }

    /// Process every instruction, returning the report.
    ///
    /// On error the state is [`BuildState::Failed`]; layers sealed before the
    /// failure stay in the store.
    pub async fn execute(&mut self) -> NobyResult<BuildReport> {
        match self.run_plan().await {
            Ok(report) => {
                self.state = BuildState::Done(report.final_key.clone());
                Ok(report)
            }
            Err(e) => {
                self.state = BuildState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_plan(&mut self) -> NobyResult<BuildReport> {
        let mut current = self.resolve_base()?;
        self.state = BuildState::Resolved(current.clone());

        let total = self.plan.layer_count();
        let mut steps = Vec::with_capacity(total);

        let plan = self.plan;
        for (index, instruction) in plan.instructions().iter().enumerate() {
            self.state = BuildState::Pending(index);
            if self.options.abort.load(Ordering::SeqCst) {
                tracing::warn!(index, "Build aborted");
                return Err(NobyError::Aborted { index });
            }

            let Some(key) = layer_key(current.as_ref(), instruction, &self.env) else {
                continue;
            };

            tracing::info!(
                step = steps.len() + 1,
                total,
                key = key.short(),
                "{instruction}"
            );

            let step = if self.store.lookup(&key).is_some() {
                tracing::info!(key = key.short(), "Using cached layer");
                StepRecord {
                    index,
                    instruction: instruction.to_string(),
                    key: key.clone(),
                    parent: current.clone(),
                    outcome: StepOutcome::Cached,
                    output: None,
                }
            } else {
                let output = self
                    .build_layer(index, instruction, current.as_ref(), &key)
                    .await?;
                StepRecord {
                    index,
                    instruction: instruction.to_string(),
                    key: key.clone(),
                    parent: current.clone(),
                    outcome: StepOutcome::Built,
                    output: Some(output),
                }
            };

            steps.push(step);
            current = Some(key);
            self.state = BuildState::Resolved(current.clone());
        }

        if current.is_none() {
            tracing::info!("Nothing to do");
        }

        Ok(BuildReport {
            final_key: current,
            steps,
            tag: None,
        })
    }

    fn resolve_base(&self) -> NobyResult<Option<LayerKey>> {
        let base = self.plan.base();
        if base == SCRATCH {
            return Ok(None);
        }

        let key = self
            .store
            .resolve_reference(base)
            .ok_or_else(|| NobyError::UnresolvedBase {
                reference: base.to_string(),
            })?;
        tracing::info!(base, key = key.short(), "Resolved base layer");
        Ok(Some(key))
    }

    async fn build_layer(
        &self,
        index: usize,
        instruction: &Instruction,
        parent: Option<&LayerKey>,
        key: &LayerKey,
    ) -> NobyResult<ExecOutput> {
        let (mode, command) = match instruction {
            Instruction::Host { command } => (ExecutionMode::Host, command),
            Instruction::Run { command } => (ExecutionMode::Sandbox, command),
            other => {
                return Err(NobyError::Internal {
                    message: format!("{} does not produce a layer", other.keyword()),
                });
            }
        };

        let snapshot = self.store.create_child(parent).await?;
        let invocation = Invocation {
            mode,
            command: command.clone(),
            root: snapshot.path().to_path_buf(),
            workdir: self.context.to_path_buf(),
            env: self.env.clone(),
        };

        let output = match self.executor.execute(&invocation).await {
            Ok(output) if output.success() => output,
            result => {
                let (exit_code, message) = match result {
                    Ok(output) => (output.exit_code, failure_message(&output)),
                    Err(e) => (None, e.to_string()),
                };
                if let Err(e) = self.store.discard(snapshot).await {
                    tracing::warn!(error = %e, "Failed to discard snapshot of failed instruction");
                }
                return Err(NobyError::Execution {
                    index,
                    line: self.plan.line(index),
                    command: command.clone(),
                    exit_code,
                    message,
                });
            }
        };

        let request = SealRequest {
            key: key.clone(),
            instruction: instruction.to_string(),
            env: self.env.clone(),
        };

        match self.store.seal(snapshot, request).await {
            Ok(_) => {}
            Err(NobyError::Conflict {
                key,
                expected,
                actual,
            }) => {
                tracing::warn!(
                    %key,
                    %expected,
                    %actual,
                    "Layer already exists with different content; keeping the existing layer"
                );
            }
            Err(e) => return Err(e),
        }

        Ok(output)
    }
}

/// Last line of stderr, or a generic message when the command was silent.
fn failure_message(output: &ExecOutput) -> String {
    output
        .stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map_or_else(
            || match output.exit_code {
                Some(_) => "command returned non-zero status".to_string(),
                None => "command was terminated by a signal".to_string(),
            },
            str::to_string,
        )
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use noby_common::NobyPaths;
    use noby_store::DirectoryBackend;

    use super::*;

    /// Executor that applies `RUN` commands of the form `write NAME CONTENT`
    /// and `exit N` directly to the snapshot.
    #[derive(Debug, Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
        abort_after_first: Option<Arc<AtomicBool>>,
    }

    #[async_trait]
    impl CommandExecutor for Scripted {
        async fn execute(&self, invocation: &Invocation) -> io::Result<ExecOutput> {
            self.calls.lock().unwrap().push(invocation.command.clone());
            if let Some(abort) = &self.abort_after_first {
                abort.store(true, Ordering::SeqCst);
            }

            let mut words = invocation.command.splitn(3, ' ');
            match (words.next(), words.next(), words.next()) {
                (Some("write"), Some(name), content) => {
                    std::fs::write(invocation.root.join(name), content.unwrap_or_default())?;
                    Ok(ExecOutput {
                        exit_code: Some(0),
                        ..ExecOutput::default()
                    })
                }
                (Some("exit"), Some(code), _) => Ok(ExecOutput {
                    exit_code: code.parse().ok(),
                    stderr: "first\nlast words\n".to_string(),
                    ..ExecOutput::default()
                }),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "unknown command")),
            }
        }
    }

    fn store(root: &Path) -> LayerStore {
        LayerStore::open(NobyPaths::with_root(root), Arc::new(DirectoryBackend)).unwrap()
    }

    async fn build(
        store: &LayerStore,
        executor: &Scripted,
        text: &str,
        options: BuildOptions,
    ) -> (NobyResult<BuildReport>, BuildState) {
        let plan = BuildPlan::parse(text).unwrap();
        let env = crate::env::resolve(&plan, &EnvSet::new());
        let context = tempfile::tempdir().unwrap();
        let mut builder = Builder::new(store, executor, &plan, context.path(), env, options);
        let result = builder.execute().await;
        (result, builder.state().clone())
    }

    #[tokio::test]
    async fn builds_then_reuses_layers() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(temp.path());
        let executor = Scripted::default();
        let plan = "FROM scratch\nRUN write a 1\nRUN write b 2\n";

        let (first, state) = build(&store, &executor, plan, BuildOptions::default()).await;
        let first = first.unwrap();
        assert_eq!(first.created(), 2);
        assert_eq!(first.reused(), 0);
        assert_eq!(first.steps[0].parent, None);
        assert_eq!(first.steps[1].parent.as_ref(), Some(&first.steps[0].key));
        assert_eq!(state, BuildState::Done(first.final_key.clone()));

        let layer = store.layer(first.final_key.as_ref().unwrap()).unwrap();
        assert_eq!(std::fs::read_to_string(layer.path.join("a")).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(layer.path.join("b")).unwrap(), "2");

        let (second, _) = build(&store, &executor, plan, BuildOptions::default()).await;
        let second = second.unwrap();
        assert_eq!(second.created(), 0);
        assert_eq!(second.reused(), 2);
        assert_eq!(second.final_key, first.final_key);
        assert_eq!(executor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_instruction_discards_its_snapshot() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(temp.path());
        let executor = Scripted::default();

        let (result, state) = build(
            &store,
            &executor,
            "FROM scratch\nRUN write a 1\nRUN exit 2\nRUN write c 3\n",
            BuildOptions::default(),
        )
        .await;

        match result.unwrap_err() {
            NobyError::Execution {
                index,
                line,
                command,
                exit_code,
                message,
            } => {
                assert_eq!(index, 2);
                assert_eq!(line, Some(3));
                assert_eq!(command, "exit 2");
                assert_eq!(exit_code, Some(2));
                assert_eq!(message, "last words");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(state, BuildState::Failed(_)));
        assert_eq!(store.list_layers().len(), 1);
        assert_eq!(std::fs::read_dir(store.paths().work()).unwrap().count(), 0);
        assert_eq!(executor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn command_that_cannot_start_has_no_exit_code() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(temp.path());

        let (result, _) = build(
            &store,
            &Scripted::default(),
            "FROM scratch\nRUN frobnicate\n",
            BuildOptions::default(),
        )
        .await;

        assert!(matches!(
            result.unwrap_err(),
            NobyError::Execution {
                index: 1,
                exit_code: None,
                ..
            }
        ));
        assert!(store.list_layers().is_empty());
    }

    #[tokio::test]
    async fn abort_stops_before_next_instruction() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(temp.path());
        let options = BuildOptions::default();
        let executor = Scripted {
            abort_after_first: Some(options.abort_handle()),
            ..Scripted::default()
        };

        let (result, state) = build(
            &store,
            &executor,
            "FROM scratch\nRUN write a 1\nRUN write b 2\n",
            options,
        )
        .await;

        assert!(matches!(result.unwrap_err(), NobyError::Aborted { index: 2 }));
        assert!(matches!(state, BuildState::Failed(_)));
        assert_eq!(store.list_layers().len(), 1);
    }

    #[tokio::test]
    async fn unknown_base_is_rejected_before_any_work() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(temp.path());
        let executor = Scripted::default();

        let (result, _) = build(
            &store,
            &executor,
            "FROM missing\nRUN write a 1\n",
            BuildOptions::default(),
        )
        .await;

        assert!(matches!(
            result.unwrap_err(),
            NobyError::UnresolvedBase { reference } if reference == "missing"
        ));
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scratch_plan_without_commands_has_nothing_to_do() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(temp.path());

        let (result, state) = build(
            &store,
            &Scripted::default(),
            "FROM scratch\nENV A=1\n",
            BuildOptions::default(),
        )
        .await;

        let report = result.unwrap();
        assert_eq!(report.final_key, None);
        assert!(report.steps.is_empty());
        assert_eq!(state, BuildState::Done(None));
    }

    #[test]
    fn failure_message_falls_back_when_silent() {
        let output = ExecOutput {
            exit_code: Some(1),
            ..ExecOutput::default()
        };
        assert_eq!(failure_message(&output), "command returned non-zero status");
        let killed = ExecOutput::default();
        assert_eq!(failure_message(&killed), "command was terminated by a signal");
    }
}
