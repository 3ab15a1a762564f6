//! Reproduction pipeline for the paper's benchmark tables and figures:
//! bootstrap a Python environment, clone or fast-forward the external
//! repositories, run the enabled invocations one after another, and keep one
//! log plus one result directory per invocation.

pub mod bootstrap;
pub mod collect;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod host;
pub mod invoke;
pub mod native;
pub mod process;
pub mod report;
pub mod sync;

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use bootstrap::{BootstrapOutcome, PythonEnv};
pub use collect::{bundle, dump_logs, Collector};
pub use config::{ConfigSource, HarnessConfig, InvocationKind, InvocationSpec, RepositorySpec};
pub use error::{EnvironmentError, InvocationError, SyncError};
pub use host::HostInfo;
pub use invoke::{InvocationRecord, InvocationStatus};
pub use native::{BuildSystem, Cmake};
pub use report::PipelineReport;
pub use sync::{RepoSync, SyncAction, SyncOutcome};

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Use the configured interpreter directly instead of the venv.
    pub skip_bootstrap: bool,
}

/// Load the plan and apply an optional `--only` selection.
pub fn load_plan(
    config_path: Option<&Path>,
    root: &Path,
    only: &[String],
) -> Result<(HarnessConfig, ConfigSource)> {
    let (mut config, source) = HarnessConfig::load(config_path, root)?;
    if !only.is_empty() {
        config.select_only(only)?;
    }
    Ok((config, source))
}

pub fn run_pipeline(
    config: &HarnessConfig,
    source: &ConfigSource,
    root: &Path,
    options: &PipelineOptions,
) -> Result<PipelineReport> {
    run_pipeline_with(config, source, root, options, &Cmake::default())
}

/// Full pass with an explicit build system. Only environment and workspace
/// failures return `Err`; repository and invocation failures are recorded in
/// the report.
pub fn run_pipeline_with(
    config: &HarnessConfig,
    source: &ConfigSource,
    root: &Path,
    options: &PipelineOptions,
    build: &dyn BuildSystem,
) -> Result<PipelineReport> {
    let root = canonical_root(root)?;
    let started_at = Utc::now();
    info!(root = %root.display(), config = %source, "starting pipeline");

    let collector = Collector::new(&root);
    collector
        .prepare_workspace(config.clean_results)
        .with_context(|| format!("failed to prepare workspace under {}", root.display()))?;

    let host = HostInfo::detect();
    fsutil::atomic_write_bytes(&collector.system_info_log(), host.render().as_bytes())?;

    let python = bootstrap_environment(config, &root, options.skip_bootstrap)
        .context("environment bootstrap failed")?;

    let repositories = sync::sync_all(&config.repositories, &root, &collector.repo_update_log());
    let failed_repositories: BTreeSet<String> = repositories
        .iter()
        .filter(|r| !r.is_ok())
        .map(|r| r.name.clone())
        .collect();

    let ctx = invoke::RunContext {
        root: &root,
        config,
        python: &python,
        collector: &collector,
        build,
        failed_repositories,
    };
    let invocations = invoke::run_invocations(&ctx);

    let report = PipelineReport {
        root: root.clone(),
        config_source: source.to_string(),
        started_at,
        finished_at: Utc::now(),
        python,
        host,
        repositories,
        invocations,
    };
    if let Err(e) = fsutil::atomic_write_json_pretty(&collector.run_summary(), &report.to_json()) {
        warn!(error = %e, "could not write run summary");
    }
    info!(ok = report.succeeded(), "pipeline finished");
    Ok(report)
}

pub fn bootstrap_environment(
    config: &HarnessConfig,
    root: &Path,
    skip: bool,
) -> std::result::Result<PythonEnv, EnvironmentError> {
    if skip {
        return Ok(PythonEnv::system(&config.bootstrap.interpreter));
    }
    let collector = Collector::new(root);
    bootstrap::bootstrap(&config.bootstrap, root, &collector.bootstrap_log())
}

/// Synchronize repositories without running anything.
pub fn sync_repositories(config: &HarnessConfig, root: &Path) -> Result<Vec<RepoSync>> {
    let root = canonical_root(root)?;
    let collector = Collector::new(&root);
    fsutil::ensure_dir(collector.log_dir())?;
    Ok(sync::sync_all(
        &config.repositories,
        &root,
        &collector.repo_update_log(),
    ))
}

#[derive(Debug, Clone)]
pub struct RepositoryPlan {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub dir: PathBuf,
    pub present: bool,
}

#[derive(Debug, Clone)]
pub struct InvocationPlan {
    pub name: String,
    pub kind: &'static str,
    pub enabled: bool,
    pub requires: Vec<String>,
    pub log: PathBuf,
    pub result_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub config_source: String,
    pub root: PathBuf,
    pub bootstrap_enabled: bool,
    pub interpreter: String,
    pub requirements: Vec<String>,
    pub clean_results: bool,
    pub repositories: Vec<RepositoryPlan>,
    pub invocations: Vec<InvocationPlan>,
}

pub fn describe_plan(config: &HarnessConfig, source: &ConfigSource, root: &Path) -> PlanSummary {
    let collector = Collector::new(root);
    PlanSummary {
        config_source: source.to_string(),
        root: root.to_path_buf(),
        bootstrap_enabled: config.bootstrap.enabled,
        interpreter: config.bootstrap.interpreter.clone(),
        requirements: config.bootstrap.requirements.clone(),
        clean_results: config.clean_results,
        repositories: config
            .repositories
            .iter()
            .map(|r| {
                let dir = r.local_dir(root);
                RepositoryPlan {
                    name: r.name.clone(),
                    url: r.url.clone(),
                    branch: r.branch.clone(),
                    present: dir.is_dir(),
                    dir,
                }
            })
            .collect(),
        invocations: config
            .invocations
            .iter()
            .map(|i| {
                let paths = collector.paths_for(&i.name);
                InvocationPlan {
                    name: i.name.clone(),
                    kind: i.kind.as_str(),
                    enabled: i.enabled,
                    requires: i.required_repositories(&config.repositories),
                    log: paths.log,
                    result_dir: paths.result,
                }
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanTargets {
    pub logs: bool,
    pub results: bool,
    pub repositories: bool,
    pub venv: bool,
}

/// Remove harness-owned directories. Repository checkouts are only removed
/// when asked for explicitly. Returns the paths that were deleted.
pub fn clean_workspace(
    config: &HarnessConfig,
    root: &Path,
    targets: CleanTargets,
) -> Result<Vec<PathBuf>> {
    let collector = Collector::new(root);
    let mut dirs = Vec::new();
    if targets.logs {
        dirs.push(collector.log_dir().to_path_buf());
    }
    if targets.results {
        dirs.push(collector.result_dir().to_path_buf());
    }
    if targets.repositories {
        dirs.extend(config.repositories.iter().map(|r| r.local_dir(root)));
    }
    if targets.venv {
        dirs.push(root.join(&config.bootstrap.venv_dir));
    }

    let mut removed = Vec::new();
    for dir in dirs {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
            info!(path = %dir.display(), "removed");
            removed.push(dir);
        }
    }
    Ok(removed)
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    fsutil::ensure_dir(root)?;
    root.canonicalize()
        .with_context(|| format!("cannot resolve harness root {}", root.display()))
}
