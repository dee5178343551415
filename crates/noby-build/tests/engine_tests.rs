//! Integration tests for the build engine.
//!
//! `RUN` commands are executed by a host shell whose working directory is the
//! snapshot root, so plans write relative paths (`echo hi > out`) and the
//! tests run without privileges.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use noby_build::{
    BuildOptions, BuildPlan, BuildReport, CommandExecutor, Engine, EnvSet, ExecOutput,
    ExecutionMode, Invocation, ProcessExecutor, StepOutcome,
};
use noby_common::{LayerKey, NobyError, NobyPaths, TagName};
use noby_store::DirectoryBackend;
use tempfile::{TempDir, tempdir};

#[derive(Debug, Default)]
struct HostSandbox {
    calls: Mutex<Vec<Invocation>>,
}

impl HostSandbox {
    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for HostSandbox {
    async fn execute(&self, invocation: &Invocation) -> io::Result<ExecOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        let mut local = invocation.clone();
        if local.mode == ExecutionMode::Sandbox {
            local.mode = ExecutionMode::Host;
            local.workdir = local.root.clone();
        }
        ProcessExecutor::new().execute(&local).await
    }
}

struct Fixture {
    _root: TempDir,
    context: TempDir,
    paths: NobyPaths,
    executor: Arc<HostSandbox>,
    engine: Engine,
}

impl Fixture {
    fn new() -> Self {
        let root = tempdir().unwrap();
        let paths = NobyPaths::with_root(root.path().join("store"));
        let executor = Arc::new(HostSandbox::default());
        let engine = Engine::with_parts(paths.clone(), Arc::new(DirectoryBackend), executor.clone())
            .unwrap();

        Self {
            _root: root,
            context: tempdir().unwrap(),
            paths,
            executor,
            engine,
        }
    }

    /// Another engine on the same store root.
    fn second_engine(&self) -> Engine {
        Engine::with_parts(
            self.paths.clone(),
            Arc::new(DirectoryBackend),
            self.executor.clone(),
        )
        .unwrap()
    }

    async fn build(&self, text: &str, overrides: &[(&str, &str)], tag: Option<&str>) -> BuildReport {
        self.try_build(text, overrides, tag).await.unwrap()
    }

    async fn try_build(
        &self,
        text: &str,
        overrides: &[(&str, &str)],
        tag: Option<&str>,
    ) -> Result<BuildReport, NobyError> {
        let plan = BuildPlan::parse(text).unwrap();
        let tag = tag.map(|t| TagName::new(t).unwrap());
        self.engine
            .build(
                &plan,
                self.context.path(),
                &env(overrides),
                tag.as_ref(),
                BuildOptions::default(),
            )
            .await
    }

    fn layer_path(&self, key: &LayerKey) -> PathBuf {
        self.engine.store().layer(key).unwrap().path
    }

    fn read(&self, key: &LayerKey, file: &str) -> String {
        std::fs::read_to_string(self.layer_path(key).join(file)).unwrap()
    }
}

fn env(pairs: &[(&str, &str)]) -> EnvSet {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, Iterator::count)
}

#[test_log::test(tokio::test)]
async fn rebuilding_unchanged_plan_creates_nothing() {
    let fx = Fixture::new();
    let plan = "FROM scratch\nRUN echo hi > out\n";

    let first = fx.build(plan, &[], None).await;
    assert_eq!(first.created(), 1);
    let key = first.final_key.clone().unwrap();
    assert_eq!(fx.read(&key, "out"), "hi\n");

    let second = fx.build(plan, &[], None).await;
    assert_eq!(second.created(), 0);
    assert_eq!(second.reused(), 1);
    assert_eq!(second.final_key, Some(key));
    assert_eq!(fx.executor.calls().len(), 1);
    assert_eq!(fx.engine.list_layers().unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn overrides_reach_commands_and_keys() {
    let fx = Fixture::new();
    let plan = "FROM scratch\nENV BAR=default\nRUN echo \"$BAR:$DEV\" > vars\n";

    let defaults = fx.build(plan, &[], None).await.final_key.unwrap();
    let modified = fx
        .build(plan, &[("BAR", "modified")], None)
        .await
        .final_key
        .unwrap();
    let extended = fx
        .build(plan, &[("DEV", "devvalue")], None)
        .await
        .final_key
        .unwrap();

    assert_eq!(fx.read(&defaults, "vars"), "default:\n");
    assert_eq!(fx.read(&modified, "vars"), "modified:\n");
    assert_eq!(fx.read(&extended, "vars"), "default:devvalue\n");

    assert_ne!(defaults, modified);
    assert_ne!(defaults, extended);
    assert_ne!(modified, extended);

    let record = fx.engine.store().layer(&modified).unwrap().record;
    assert_eq!(record.env, env(&[("BAR", "modified")]));
}

#[test_log::test(tokio::test)]
async fn env_change_keeps_ancestor_layers() {
    let fx = Fixture::new();
    let plan = "FROM scratch\nRUN echo a > a\nENV BAR=x\nRUN echo $BAR > b\nRUN echo c > c\n";

    let one = fx.build(plan, &[("BAR", "one")], None).await;
    let two = fx.build(plan, &[("BAR", "two")], None).await;

    assert_eq!(one.steps[0].key, two.steps[0].key);
    assert_eq!(two.steps[0].outcome, StepOutcome::Cached);
    assert_ne!(one.steps[1].key, two.steps[1].key);
    assert_ne!(one.final_key, two.final_key);
    assert_eq!((two.reused(), two.created()), (1, 2));

    assert_eq!(fx.read(two.final_key.as_ref().unwrap(), "b"), "two\n");
    assert_eq!(fx.read(one.final_key.as_ref().unwrap(), "b"), "one\n");
}

#[test_log::test(tokio::test)]
async fn instruction_order_changes_keys() {
    let fx = Fixture::new();

    let ab = fx
        .build("FROM scratch\nRUN echo a >> log\nRUN echo b >> log\n", &[], None)
        .await;
    let ba = fx
        .build("FROM scratch\nRUN echo b >> log\nRUN echo a >> log\n", &[], None)
        .await;

    assert_ne!(ab.final_key, ba.final_key);
    assert_eq!(fx.read(ab.final_key.as_ref().unwrap(), "log"), "a\nb\n");
    assert_eq!(fx.read(ba.final_key.as_ref().unwrap(), "log"), "b\na\n");
}

#[test_log::test(tokio::test)]
async fn keys_are_reproducible_across_stores() {
    let plan = "FROM scratch\nENV V=1\nRUN echo $V > v\nRUN echo done > done\n";

    let first = Fixture::new().build(plan, &[], None).await;
    let second = Fixture::new().build(plan, &[], None).await;

    let keys = |r: &BuildReport| r.steps.iter().map(|s| s.key.clone()).collect::<Vec<_>>();
    assert_eq!(keys(&first), keys(&second));
}

#[test_log::test(tokio::test)]
async fn from_tag_chains_onto_its_layer() {
    let fx = Fixture::new();

    let base = fx
        .build("FROM scratch\nRUN echo base > base\n", &[], Some("base"))
        .await;
    let base_key = base.final_key.clone().unwrap();
    assert_eq!(base.tag.as_ref().map(TagName::as_str), Some("base"));

    let app = fx
        .build("FROM base\nRUN echo app > app\n", &[], Some("app"))
        .await;
    let app_key = app.final_key.clone().unwrap();

    assert_eq!(app.steps[0].parent, Some(base_key.clone()));
    assert_eq!(fx.read(&app_key, "base"), "base\n");
    assert_eq!(fx.read(&app_key, "app"), "app\n");
    assert!(!fx.layer_path(&base_key).join("app").exists());

    let by_key = fx
        .build(
            &format!("FROM {base_key}\nRUN echo app > app\n"),
            &[],
            None,
        )
        .await;
    assert_eq!(by_key.final_key, Some(app_key));
    assert_eq!(by_key.steps[0].outcome, StepOutcome::Cached);
}

#[test_log::test(tokio::test)]
async fn unknown_base_fails_before_any_work() {
    let fx = Fixture::new();
    let err = fx
        .try_build("FROM nowhere\nRUN echo hi > out\n", &[], None)
        .await
        .unwrap_err();

    assert!(matches!(err, NobyError::UnresolvedBase { reference } if reference == "nowhere"));
    assert!(fx.executor.calls().is_empty());
    assert!(fx.engine.list_layers().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn host_commands_write_through_target() {
    let fx = Fixture::new();
    std::fs::write(fx.context.path().join("payload.txt"), "from context\n").unwrap();

    let report = fx
        .build(
            "FROM scratch\nENV GREETING=hello\n\
             HOST cp payload.txt \"$TARGET/payload.txt\"\n\
             HOST echo \"$GREETING\" > \"$TARGET/greeting\"\n\
             RUN cat payload.txt greeting > combined\n",
            &[],
            None,
        )
        .await;

    let key = report.final_key.unwrap();
    assert_eq!(fx.read(&key, "combined"), "from context\nhello\n");

    let calls = fx.executor.calls();
    assert_eq!(calls[0].mode, ExecutionMode::Host);
    assert_eq!(calls[0].workdir, fx.context.path());
    assert_eq!(calls[2].mode, ExecutionMode::Sandbox);
}

#[test_log::test(tokio::test)]
async fn failure_keeps_earlier_layers_and_leaves_no_snapshot() {
    let fx = Fixture::new();
    let failing = "FROM scratch\nRUN echo one > one\nRUN echo boom >&2; exit 7\nRUN echo three > three\n";

    let err = fx.try_build(failing, &[], Some("app")).await.unwrap_err();
    match err {
        NobyError::Execution {
            index,
            exit_code,
            message,
            ..
        } => {
            assert_eq!(index, 2);
            assert_eq!(exit_code, Some(7));
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(entries(&fx.paths.work()), 0);
    assert_eq!(fx.engine.list_layers().unwrap().len(), 1);
    assert!(fx.engine.list_tags().unwrap().is_empty());
    assert_eq!(fx.executor.calls().len(), 2);

    let fixed = fx
        .build(
            "FROM scratch\nRUN echo one > one\nRUN echo fixed > two\n",
            &[],
            Some("app"),
        )
        .await;
    assert_eq!(fixed.steps[0].outcome, StepOutcome::Cached);
    assert_eq!(fixed.steps[1].outcome, StepOutcome::Built);
}

#[test_log::test(tokio::test)]
async fn leftover_work_snapshots_are_reclaimed() {
    let fx = Fixture::new();
    let stale = fx.paths.work().join("stale");
    std::fs::create_dir_all(stale.join("etc")).unwrap();
    let stale_run = fx.paths.runs().join("stale");
    std::fs::create_dir_all(&stale_run).unwrap();

    fx.build("FROM scratch\nRUN true\n", &[], None).await;
    assert!(!stale.exists());
    assert!(!stale_run.exists());
}

#[test_log::test(tokio::test)]
async fn unindexed_layer_directory_does_not_block_the_build() {
    let plan = "FROM scratch\nRUN echo hi > out\n";
    let key = Fixture::new().build(plan, &[], None).await.final_key.unwrap();

    let fx = Fixture::new();
    let leftover = fx.paths.layer(&key);
    std::fs::create_dir_all(&leftover).unwrap();
    std::fs::write(leftover.join("half-written"), "x").unwrap();

    let report = fx.build(plan, &[], None).await;
    assert_eq!(report.final_key, Some(key.clone()));
    assert_eq!(report.created(), 1);
    assert_eq!(fx.read(&key, "out"), "hi\n");
    assert!(!leftover.join("half-written").exists());

    let again = fx.build(plan, &[], None).await;
    assert_eq!(again.reused(), 1);
}

#[test_log::test(tokio::test)]
async fn scratch_plan_without_commands_tags_nothing() {
    let fx = Fixture::new();
    let report = fx.build("FROM scratch\nENV A=1\n", &[], Some("empty")).await;

    assert_eq!(report.final_key, None);
    assert_eq!(report.tag, None);
    assert!(fx.engine.list_tags().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn run_uses_a_throwaway_snapshot() {
    let fx = Fixture::new();
    let key = fx
        .build(
            "FROM scratch\nENV BAR=default\nRUN echo hi > out\n",
            &[("BAR", "modified")],
            Some("app"),
        )
        .await
        .final_key
        .unwrap();

    let outcome = fx
        .engine
        .run("app", "cat out; echo $BAR; echo changed > out; touch extra")
        .await
        .unwrap();
    assert!(outcome.success());
    assert_eq!(outcome.stdout, "hi\nmodified\n");

    assert_eq!(fx.read(&key, "out"), "hi\n");
    assert!(!fx.layer_path(&key).join("extra").exists());
    assert_eq!(entries(&fx.paths.runs()), 0);
}

#[test_log::test(tokio::test)]
async fn run_reports_exit_status_and_cleans_up() {
    let fx = Fixture::new();
    fx.build("FROM scratch\nRUN true\n", &[], Some("app")).await;

    let outcome = fx.engine.run("app", "echo nope >&2; exit 3").await.unwrap();
    assert_eq!(outcome.exit_code, Some(3));
    assert_eq!(outcome.stderr, "nope\n");
    assert_eq!(entries(&fx.paths.runs()), 0);

    let err = fx.engine.run("missing", "true").await.unwrap_err();
    assert!(matches!(err, NobyError::TagNotFound { .. }));
}

#[test_log::test(tokio::test)]
async fn wipe_forgets_every_tag() {
    let fx = Fixture::new();
    fx.build("FROM scratch\nRUN echo hi > out\n", &[], Some("app"))
        .await;
    fx.build("FROM app\nRUN echo more > more\n", &[], Some("more"))
        .await;

    fx.engine.wipe().await.unwrap();

    assert!(fx.engine.list_tags().unwrap().is_empty());
    assert_eq!(fx.engine.store().resolve_tag("app"), None);
    assert!(fx.engine.list_layers().unwrap().is_empty());
    assert_eq!(entries(&fx.paths.layers()), 0);

    let err = fx
        .try_build("FROM app\nRUN true\n", &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, NobyError::UnresolvedBase { .. }));
}

#[test_log::test(tokio::test)]
async fn tags_pin_layers_against_deletion() {
    let fx = Fixture::new();
    let report = fx
        .build("FROM scratch\nRUN echo a > a\nRUN echo b > b\n", &[], Some("app"))
        .await;
    let first = report.steps[0].key.clone();
    let last = report.final_key.unwrap();

    let err = fx.engine.delete_layer(&last).await.unwrap_err();
    assert!(matches!(err, NobyError::InUse { .. }));
    let err = fx.engine.delete_layer(&first).await.unwrap_err();
    assert!(matches!(err, NobyError::InUse { .. }));
    assert!(fx.engine.collect_garbage().await.unwrap().is_empty());

    let alias = TagName::new("alias").unwrap();
    assert_eq!(fx.engine.tag(&alias, "app").await.unwrap(), last);
    fx.engine
        .untag(&TagName::new("app").unwrap())
        .await
        .unwrap();
    assert!(fx.engine.collect_garbage().await.unwrap().is_empty());

    fx.engine.untag(&alias).await.unwrap();
    let removed = fx.engine.collect_garbage().await.unwrap();
    assert_eq!(removed, vec![last, first]);
    assert!(fx.engine.list_layers().unwrap().is_empty());

    let err = fx.engine.untag(&alias).await.unwrap_err();
    assert!(matches!(err, NobyError::TagNotFound { .. }));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn concurrent_builds_share_layers() {
    let fx = Fixture::new();
    let other = fx.second_engine();
    let plan = BuildPlan::parse("FROM scratch\nRUN echo hi > out\nRUN echo more > more\n").unwrap();
    let context = fx.context.path();

    let env_a = EnvSet::new();
    let env_b = EnvSet::new();
    let (a, b) = tokio::join!(
        fx.engine
            .build(&plan, context, &env_a, None, BuildOptions::default()),
        other.build(&plan, context, &env_b, None, BuildOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.final_key, b.final_key);
    assert_eq!(a.created() + b.created(), 2);
    assert_eq!(fx.executor.calls().len(), 2);
    assert_eq!(fx.engine.list_layers().unwrap().len(), 2);
    assert_eq!(entries(&fx.paths.work()), 0);
}
