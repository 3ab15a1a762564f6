//! Sequential execution of the configured benchmark invocations.
//!
//! Each invocation runs to completion before the next starts; concurrent
//! runs would disturb each other's timings. A failure is recorded and the
//! runner moves on, so one broken benchmark never hides the others.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::bootstrap::PythonEnv;
use crate::collect::{Collector, InvocationPaths};
use crate::config::{HarnessConfig, InvocationKind, InvocationSpec};
use crate::error::InvocationError;
use crate::fsutil::copy_tree;
use crate::native::BuildSystem;
use crate::process::{run_step, StepCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Succeeded => "succeeded",
            InvocationStatus::Failed => "failed",
            InvocationStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub name: String,
    pub kind: &'static str,
    /// 1-based position in the run list.
    pub position: usize,
    pub status: InvocationStatus,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub log_path: PathBuf,
    pub result_dir: PathBuf,
    pub detail: Option<String>,
}

impl InvocationRecord {
    pub fn succeeded(&self) -> bool {
        self.status == InvocationStatus::Succeeded
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "kind": self.kind,
            "position": self.position,
            "status": self.status.as_str(),
            "exit_code": self.exit_code,
            "duration_ms": self.duration.as_millis() as u64,
            "log": self.log_path.display().to_string(),
            "result_dir": self.result_dir.display().to_string(),
            "detail": self.detail,
        })
    }
}

/// Everything an invocation may need from earlier pipeline stages.
pub struct RunContext<'a> {
    pub root: &'a Path,
    pub config: &'a HarnessConfig,
    pub python: &'a PythonEnv,
    pub collector: &'a Collector,
    pub build: &'a dyn BuildSystem,
    /// Repositories whose synchronization failed in this run.
    pub failed_repositories: BTreeSet<String>,
}

pub fn run_invocations(ctx: &RunContext<'_>) -> Vec<InvocationRecord> {
    let selected: Vec<&InvocationSpec> = ctx.config.enabled_invocations().collect();
    let total = selected.len();
    if total == 0 {
        info!("no invocations enabled");
    }
    selected
        .into_iter()
        .enumerate()
        .map(|(idx, inv)| run_one(ctx, idx + 1, total, inv))
        .collect()
}

/// Captured output of every step of one invocation.
#[derive(Default)]
struct Transcript {
    text: String,
    exit_code: Option<i32>,
}

impl Transcript {
    fn note(&mut self, line: impl AsRef<str>) {
        let _ = writeln!(self.text, "{}", line.as_ref());
    }

    fn step(&mut self, label: &str, cmd: &StepCommand) -> Result<(), InvocationError> {
        let out = match run_step(cmd) {
            Ok(out) => out,
            Err(source) => {
                self.note(format!("Command: {}", cmd.command_line()));
                self.note(format!("Failed to start: {}", source));
                return Err(InvocationError::Spawn {
                    program: cmd.program.clone(),
                    source,
                });
            }
        };
        out.render_into(&mut self.text);
        self.exit_code = out.exit_code;
        if out.success() {
            Ok(())
        } else {
            Err(InvocationError::NonZeroExit {
                step: label.to_string(),
                status: out.status_label(),
            })
        }
    }
}

fn run_one(
    ctx: &RunContext<'_>,
    position: usize,
    total: usize,
    inv: &InvocationSpec,
) -> InvocationRecord {
    let started = Instant::now();
    let paths = ctx.collector.paths_for(&inv.name);
    let mut transcript = Transcript::default();
    transcript.note(format!(
        "Invocation: {} ({}) [{}/{}]",
        inv.name,
        inv.kind.as_str(),
        position,
        total
    ));
    transcript.note(format!("Started: {}", Utc::now().to_rfc3339()));
    transcript.note("-".repeat(50));
    info!(invocation = %inv.name, position, total, "running");

    let blocked = inv
        .required_repositories(&ctx.config.repositories)
        .into_iter()
        .find(|r| ctx.failed_repositories.contains(r));

    let (mut status, mut detail) = match (blocked, ctx.collector.prepare_invocation(&inv.name)) {
        (_, Err(e)) => {
            let err = InvocationError::Collector(e);
            transcript.note(format!("ERROR: {}", err));
            (InvocationStatus::Failed, Some(err.to_string()))
        }
        (Some(repo), Ok(_)) => {
            let reason = format!("skipped: repository '{}' failed to synchronize", repo);
            transcript.note(&reason);
            (InvocationStatus::Skipped, Some(reason))
        }
        (None, Ok(paths)) => match execute(ctx, inv, &paths, &mut transcript) {
            Ok(()) => (InvocationStatus::Succeeded, None),
            Err(err) => {
                transcript.note(format!("ERROR: {}", err));
                (InvocationStatus::Failed, Some(err.to_string()))
            }
        },
    };

    let duration = started.elapsed();
    transcript.note(format!(
        "Finished: {} status={} total={:.3}s",
        Utc::now().to_rfc3339(),
        status.as_str(),
        duration.as_secs_f64()
    ));
    if let Err(e) = ctx.collector.write_log(&paths, &transcript.text) {
        let err = InvocationError::Collector(e);
        status = InvocationStatus::Failed;
        detail = Some(err.to_string());
    }

    match status {
        InvocationStatus::Succeeded => {
            info!(invocation = %inv.name, secs = duration.as_secs_f64(), "succeeded")
        }
        InvocationStatus::Skipped => {
            warn!(invocation = %inv.name, reason = detail.as_deref().unwrap_or(""), "skipped")
        }
        InvocationStatus::Failed => {
            error!(invocation = %inv.name, error = detail.as_deref().unwrap_or(""), "failed")
        }
    }

    InvocationRecord {
        name: inv.name.clone(),
        kind: inv.kind.as_str(),
        position,
        status,
        exit_code: transcript.exit_code,
        duration,
        log_path: paths.log,
        result_dir: paths.result,
        detail,
    }
}

fn execute(
    ctx: &RunContext<'_>,
    inv: &InvocationSpec,
    paths: &InvocationPaths,
    transcript: &mut Transcript,
) -> Result<(), InvocationError> {
    let base_env = base_env(ctx, inv, paths);
    match &inv.kind {
        InvocationKind::Script {
            script,
            interpreter,
        } => {
            let scripts_dir = ctx.root.join(&ctx.config.scripts_dir);
            let script_path = scripts_dir.join(script);
            if !script_path.is_file() {
                return Err(InvocationError::ScriptMissing(script_path));
            }
            let program = interpreter
                .clone()
                .unwrap_or_else(|| ctx.python.python.to_string_lossy().to_string());
            let cmd = StepCommand::new(program, &scripts_dir)
                .arg(script_path.to_string_lossy().to_string())
                .args(inv.args.iter().cloned())
                .envs(&base_env)
                .envs(&ctx.python.activation_env());
            transcript.step("script", &cmd)
        }
        InvocationKind::Command { command, cwd } => {
            let dir = resolve_cwd(ctx, cwd.as_deref());
            if !dir.is_dir() {
                return Err(InvocationError::Other(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
            let cmd = StepCommand::new(command[0].clone(), &dir)
                .args(command[1..].iter().cloned())
                .args(inv.args.iter().cloned())
                .envs(&base_env);
            transcript.step("command", &cmd)
        }
        InvocationKind::CmakeTarget {
            repository,
            target,
            configure_args,
            build_dir,
            collect_from,
        } => {
            let repo = ctx
                .config
                .repository(repository)
                .ok_or_else(|| InvocationError::UnknownRepository(repository.clone()))?;
            let source = repo.local_dir(ctx.root);
            let build = source.join(build_dir);

            if let Some(configure) = ctx.build.configure_step(&source, &build, configure_args) {
                transcript.step("configure", &configure.envs(&base_env))?;
                ctx.build
                    .mark_configured(&build, configure_args)
                    .map_err(|e| {
                        InvocationError::Other(format!("could not record configure state: {}", e))
                    })?;
            } else {
                transcript.note(format!("Build directory {} already configured", build.display()));
            }
            let jobs = ctx.config.build_jobs();
            transcript.step("build", &ctx.build.build_step(&build, target, jobs).envs(&base_env))?;

            let exe = ctx
                .build
                .locate(&build, target)
                .ok_or_else(|| InvocationError::TargetNotFound {
                    target: target.clone(),
                    build_dir: build.clone(),
                })?;
            let run = StepCommand::new(exe.to_string_lossy().to_string(), &build)
                .args(inv.args.iter().cloned())
                .envs(&base_env);
            transcript.step(target, &run)?;

            if let Some(rel) = collect_from {
                let src = source.join(rel);
                if !src.is_dir() {
                    return Err(InvocationError::ResultsMissing(src));
                }
                let copied = copy_tree(&src, &paths.result)?;
                transcript.note(format!(
                    "Copied {} file(s) from {} to {}",
                    copied,
                    src.display(),
                    paths.result.display()
                ));
            }
            Ok(())
        }
    }
}

fn resolve_cwd(ctx: &RunContext<'_>, cwd: Option<&str>) -> PathBuf {
    match cwd {
        None => ctx.root.to_path_buf(),
        Some(name) => match ctx.config.repository(name) {
            Some(repo) => repo.local_dir(ctx.root),
            None => ctx.root.join(name),
        },
    }
}

fn base_env(
    ctx: &RunContext<'_>,
    inv: &InvocationSpec,
    paths: &InvocationPaths,
) -> Vec<(String, String)> {
    vec![
        ("REPRO_ROOT".to_string(), ctx.root.to_string_lossy().to_string()),
        ("REPRO_INVOCATION".to_string(), inv.name.clone()),
        (
            "REPRO_RESULT_DIR".to_string(),
            paths.result.to_string_lossy().to_string(),
        ),
        (
            "REPRO_LOG_DIR".to_string(),
            ctx.collector.log_dir().to_string_lossy().to_string(),
        ),
    ]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::native::Cmake;
    use std::fs;

    /// Stands in for CMake: "configure" writes a cache, "build" drops an
    /// executable shell script named after the target.
    struct ScriptedBuild;

    impl BuildSystem for ScriptedBuild {
        fn configure_step(
            &self,
            source: &Path,
            build_dir: &Path,
            _args: &[String],
        ) -> Option<StepCommand> {
            if build_dir.join("CMakeCache.txt").exists() {
                return None;
            }
            Some(StepCommand::new("sh", source).args([
                "-c".to_string(),
                format!(
                    "mkdir -p '{0}' && touch '{0}/CMakeCache.txt' && echo configured",
                    build_dir.display()
                ),
            ]))
        }

        fn build_step(&self, build_dir: &Path, target: &str, _jobs: usize) -> StepCommand {
            StepCommand::new("sh", build_dir).args([
                "-c".to_string(),
                format!(
                    "mkdir -p bin && printf '#!/bin/sh\\necho bench $*\\nmkdir -p ../out && echo 42 > ../out/ratio.csv\\n' > bin/{0} && chmod +x bin/{0} && echo built {0}",
                    target
                ),
            ])
        }

        fn locate(&self, build_dir: &Path, target: &str) -> Option<PathBuf> {
            Cmake::default().locate(build_dir, target)
        }
    }

    fn config(yaml: &str) -> HarnessConfig {
        HarnessConfig::from_yaml(yaml).expect("config")
    }

    fn run(root: &Path, cfg: &HarnessConfig, failed: &[&str]) -> Vec<InvocationRecord> {
        let python = PythonEnv::system("sh");
        let collector = Collector::new(root);
        collector.prepare_workspace(true).expect("workspace");
        let ctx = RunContext {
            root,
            config: cfg,
            python: &python,
            collector: &collector,
            build: &ScriptedBuild,
            failed_repositories: failed.iter().map(|s| s.to_string()).collect(),
        };
        run_invocations(&ctx)
    }

    #[test]
    fn failure_in_the_middle_does_not_stop_later_invocations() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = config(
            r#"
invocations:
  - { name: first, kind: command, command: [sh, -c, "echo one"] }
  - { name: second, kind: command, command: [sh, -c, "echo two; exit 1"] }
  - { name: third, kind: command, command: [sh, -c, "echo three"] }
"#,
        );
        let records = run(tmp.path(), &cfg, &[]);
        let statuses: Vec<_> = records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                InvocationStatus::Succeeded,
                InvocationStatus::Failed,
                InvocationStatus::Succeeded
            ]
        );
        assert_eq!(records[1].exit_code, Some(1));
        assert_eq!(records[2].position, 3);
        let log = fs::read_to_string(tmp.path().join("logs/second.log")).expect("log");
        assert!(log.contains("two"));
        assert!(log.contains("status=failed"));
    }

    #[test]
    fn disabled_invocations_produce_no_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = config(
            r#"
invocations:
  - { name: on, kind: command, command: ["true"] }
  - { name: off, kind: command, command: ["true"], enabled: false }
"#,
        );
        let records = run(tmp.path(), &cfg, &[]);
        assert_eq!(records.len(), 1);
        assert!(tmp.path().join("logs/on.log").exists());
        assert!(!tmp.path().join("logs/off.log").exists());
        assert!(tmp.path().join("result/on").is_dir());
    }

    #[test]
    fn script_runs_in_scripts_dir_with_result_env() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("scripts")).expect("mkdir");
        fs::write(
            tmp.path().join("scripts/popularity.sh"),
            "pwd\necho \"$1\" > \"$REPRO_RESULT_DIR/arg.txt\"\n",
        )
        .expect("write");
        let cfg = config(
            r#"
invocations:
  - { name: popularity, kind: script, script: popularity.sh, args: [hello] }
  - { name: missing, kind: script, script: nope.py }
"#,
        );
        let records = run(tmp.path(), &cfg, &[]);
        assert!(records[0].succeeded(), "{:?}", records[0]);
        assert_eq!(
            fs::read_to_string(tmp.path().join("result/popularity/arg.txt")).expect("read"),
            "hello\n"
        );
        let log = fs::read_to_string(&records[0].log_path).expect("log");
        assert!(log.contains("scripts"));
        assert_eq!(records[1].status, InvocationStatus::Failed);
        assert!(records[1].detail.as_deref().unwrap_or("").contains("script not found"));
    }

    #[test]
    fn invocations_of_failed_repository_are_skipped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = config(
            r#"
repositories:
  - { name: btrblocks, url: "file:///nowhere", branch: main }
invocations:
  - { name: total, kind: command, command: ["true"], requires: [btrblocks] }
  - { name: other, kind: command, command: ["true"] }
"#,
        );
        let records = run(tmp.path(), &cfg, &["btrblocks"]);
        assert_eq!(records[0].status, InvocationStatus::Skipped);
        assert!(records[1].succeeded());
        let log = fs::read_to_string(tmp.path().join("logs/total.log")).expect("log");
        assert!(log.contains("repository 'btrblocks' failed to synchronize"));
    }

    #[test]
    fn command_inside_a_failed_repository_is_skipped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("btrblocks")).expect("mkdir");
        let cfg = config(
            r#"
repositories:
  - { name: btrblocks, url: "file:///nowhere", branch: main }
invocations:
  - { name: stale, kind: command, cwd: btrblocks, command: ["true"] }
"#,
        );
        let records = run(tmp.path(), &cfg, &["btrblocks"]);
        assert_eq!(records[0].status, InvocationStatus::Skipped);
        assert!(records[0].detail.as_deref().unwrap_or("").contains("btrblocks"));

        let records = run(tmp.path(), &cfg, &[]);
        assert!(records[0].succeeded(), "{:?}", records[0]);
    }

    #[test]
    fn collector_failure_only_fails_its_invocation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = config(
            r#"
invocations:
  - { name: first, kind: command, command: [sh, -c, "echo squat > \"$REPRO_RESULT_DIR/../second\""] }
  - { name: second, kind: command, command: [sh, -c, "echo never"] }
  - { name: third, kind: command, command: [sh, -c, "echo three"] }
"#,
        );
        let records = run(tmp.path(), &cfg, &[]);
        assert!(records[0].succeeded(), "{:?}", records[0]);
        assert_eq!(records[1].status, InvocationStatus::Failed);
        assert!(
            records[1].detail.as_deref().unwrap_or("").contains("collector error"),
            "{:?}",
            records[1].detail
        );
        assert!(records[2].succeeded(), "{:?}", records[2]);
        let log = fs::read_to_string(tmp.path().join("logs/second.log")).expect("log");
        assert!(!log.contains("never"));
        assert!(log.contains("status=failed"));
    }

    #[test]
    fn cmake_target_configures_builds_runs_and_collects() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("fastlanes")).expect("mkdir");
        let cfg = config(
            r#"
repositories:
  - { name: fastlanes, url: "file:///unused", branch: main }
invocations:
  - name: bench_compression_ratio
    kind: cmake_target
    repository: fastlanes
    target: bench_compression_ratio
    collect_from: out
    args: [--fast]
"#,
        );

        let records = run(tmp.path(), &cfg, &[]);
        assert!(records[0].succeeded(), "{:?}", records[0]);
        let log = fs::read_to_string(&records[0].log_path).expect("log");
        assert!(log.contains("configured"));
        assert!(log.contains("built bench_compression_ratio"));
        assert!(log.contains("bench --fast"));
        assert_eq!(
            fs::read_to_string(tmp.path().join("result/bench_compression_ratio/ratio.csv"))
                .expect("collected"),
            "42\n"
        );

        // Second run reuses the configured build directory.
        let records = run(tmp.path(), &cfg, &[]);
        assert!(records[0].succeeded());
        let log = fs::read_to_string(&records[0].log_path).expect("log");
        assert!(log.contains("already configured"));
        assert!(!log.contains("\nconfigured\n"));
    }

    #[test]
    fn missing_program_is_a_failed_invocation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = config(
            r#"
invocations:
  - { name: ghost, kind: command, command: [repro-no-such-binary] }
"#,
        );
        let records = run(tmp.path(), &cfg, &[]);
        assert_eq!(records[0].status, InvocationStatus::Failed);
        let log = fs::read_to_string(&records[0].log_path).expect("log");
        assert!(log.contains("Failed to start"));
    }
}
