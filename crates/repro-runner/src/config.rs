use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "harness.yaml";
pub const DEFAULT_CONFIG_YAML: &str = include_str!("default_harness.yaml");

pub const LOG_DIR: &str = "logs";
pub const RESULT_DIR: &str = "result";
pub const REPO_UPDATE_LOG: &str = "repo_update.log";
pub const BOOTSTRAP_LOG: &str = "bootstrap.log";
pub const SYSTEM_INFO_LOG: &str = "system_info.log";
pub const RUN_SUMMARY: &str = "run_summary.json";

/// Log stems owned by the harness itself; invocation names may not reuse them.
const RESERVED_NAMES: &[&str] = &["repo_update", "bootstrap", "system_info", "run_summary"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_true")]
    pub clean_results: bool,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
    /// Parallel build jobs handed to native builds. Defaults to the CPU count.
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub repositories: Vec<RepositorySpec>,
    #[serde(default)]
    pub invocations: Vec<InvocationSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_min_version")]
    pub min_version: String,
    #[serde(default = "default_venv_dir")]
    pub venv_dir: String,
    #[serde(default = "default_requirements")]
    pub requirements: Vec<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: default_interpreter(),
            min_version: default_min_version(),
            venv_dir: default_venv_dir(),
            requirements: default_requirements(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub name: String,
    pub url: String,
    /// Branch to track, or a full 40-character commit hash to pin.
    pub branch: String,
    /// Local directory relative to the harness root. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

impl RepositorySpec {
    pub fn local_dir(&self, root: &Path) -> PathBuf {
        root.join(self.dir.as_deref().unwrap_or(&self.name))
    }

    pub fn is_pinned_commit(&self) -> bool {
        self.branch.len() == 40 && self.branch.chars().all(|c| c.is_ascii_hexdigit())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Repositories that must have synchronized for this invocation to run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(flatten)]
    pub kind: InvocationKind,
}

impl InvocationSpec {
    /// Repositories this invocation depends on: the explicit `requires`,
    /// the repository of a native build target, and the repository a
    /// command runs inside.
    pub fn required_repositories(&self, repositories: &[RepositorySpec]) -> Vec<String> {
        let implicit = match &self.kind {
            InvocationKind::CmakeTarget { repository, .. } => Some(repository.as_str()),
            InvocationKind::Command { cwd: Some(cwd), .. }
                if repositories.iter().any(|r| &r.name == cwd) =>
            {
                Some(cwd.as_str())
            }
            _ => None,
        };
        let mut out: Vec<String> = self.requires.clone();
        if let Some(repo) = implicit {
            if !out.iter().any(|r| r == repo) {
                out.insert(0, repo.to_string());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationKind {
    /// A harness-owned script under `scripts_dir`.
    Script {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interpreter: Option<String>,
    },
    /// A native build target of a synchronized repository.
    CmakeTarget {
        repository: String,
        target: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        configure_args: Vec<String>,
        #[serde(default = "default_build_dir")]
        build_dir: String,
        /// Directory inside the repository whose contents are copied into
        /// `result/<name>/` after a successful run.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collect_from: Option<String>,
    },
    /// An arbitrary argv. `cwd` names a repository or a path relative to
    /// the harness root.
    Command {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
}

impl InvocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationKind::Script { .. } => "script",
            InvocationKind::CmakeTarget { .. } => "cmake_target",
            InvocationKind::Command { .. } => "command",
        }
    }
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    BuiltIn,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(p) => write!(f, "{}", p.display()),
            ConfigSource::BuiltIn => write!(f, "<built-in>"),
        }
    }
}

impl HarnessConfig {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(DEFAULT_CONFIG_YAML).context("built-in configuration is invalid")
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: HarnessConfig = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `explicit` if given (it must exist), else `<root>/harness.yaml`
    /// when present, else the built-in plan.
    pub fn load(explicit: Option<&Path>, root: &Path) -> Result<(Self, ConfigSource)> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let candidate = root.join(DEFAULT_CONFIG_FILE);
                candidate.exists().then_some(candidate)
            }
        };
        match path {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                let cfg = Self::from_yaml(&raw)
                    .with_context(|| format!("invalid config {}", path.display()))?;
                Ok((cfg, ConfigSource::File(path)))
            }
            None => Ok((Self::builtin()?, ConfigSource::BuiltIn)),
        }
    }

    pub fn repository(&self, name: &str) -> Option<&RepositorySpec> {
        self.repositories.iter().find(|r| r.name == name)
    }

    pub fn enabled_invocations(&self) -> impl Iterator<Item = &InvocationSpec> {
        self.invocations.iter().filter(|i| i.enabled)
    }

    /// Enable exactly the named invocations, keeping configured order.
    pub fn select_only(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.invocations.iter().any(|i| &i.name == name) {
                return Err(anyhow!("unknown invocation '{}'", name));
            }
        }
        for inv in self.invocations.iter_mut() {
            inv.enabled = names.contains(&inv.name);
        }
        Ok(())
    }

    pub fn build_jobs(&self) -> usize {
        self.jobs.filter(|j| *j > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        })
    }

    /// Report every problem at once rather than the first one.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let mut repo_names = BTreeSet::new();
        let mut repo_dirs = BTreeSet::new();
        for repo in &self.repositories {
            if !is_safe_name(&repo.name) {
                problems.push(format!("repository name '{}' is not a plain file name", repo.name));
            }
            if !repo_names.insert(repo.name.as_str()) {
                problems.push(format!("duplicate repository '{}'", repo.name));
            }
            let dir = repo.dir.as_deref().unwrap_or(&repo.name);
            if !repo_dirs.insert(dir) {
                problems.push(format!("repository directory '{}' used twice", dir));
            }
            if repo.url.trim().is_empty() {
                problems.push(format!("repository '{}' has no url", repo.name));
            }
            if repo.branch.trim().is_empty() {
                problems.push(format!("repository '{}' has no branch", repo.name));
            }
        }

        let mut inv_names = BTreeSet::new();
        for inv in &self.invocations {
            if !is_safe_name(&inv.name) {
                problems.push(format!("invocation name '{}' is not a plain file name", inv.name));
            }
            if RESERVED_NAMES.contains(&inv.name.as_str()) {
                problems.push(format!("invocation name '{}' is reserved", inv.name));
            }
            if !inv_names.insert(inv.name.as_str()) {
                problems.push(format!("duplicate invocation '{}'", inv.name));
            }
            for repo in inv.required_repositories(&self.repositories) {
                if !repo_names.contains(repo.as_str()) {
                    problems.push(format!(
                        "invocation '{}' requires unknown repository '{}'",
                        inv.name, repo
                    ));
                }
            }
            match &inv.kind {
                InvocationKind::Script { script, .. } if script.trim().is_empty() => {
                    problems.push(format!("invocation '{}' has an empty script", inv.name));
                }
                InvocationKind::CmakeTarget { target, .. } if target.trim().is_empty() => {
                    problems.push(format!("invocation '{}' has an empty target", inv.name));
                }
                InvocationKind::Command { command, .. } if command.is_empty() => {
                    problems.push(format!("invocation '{}' has an empty command", inv.name));
                }
                _ => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid harness config:\n  - {}", problems.join("\n  - ")))
        }
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
}

fn default_true() -> bool {
    true
}

fn default_scripts_dir() -> String {
    "scripts".to_string()
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_min_version() -> String {
    "3.9".to_string()
}

fn default_venv_dir() -> String {
    ".venv".to_string()
}

fn default_requirements() -> Vec<String> {
    vec![
        "pandas".to_string(),
        "duckdb>=1.2,<1.3".to_string(),
        "numpy".to_string(),
    ]
}

fn default_build_dir() -> String {
    "build".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_plan_has_the_four_repositories() {
        let cfg = HarnessConfig::builtin().expect("built-in config");
        let names: Vec<_> = cfg.repositories.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["fastlanes", "data_repo", "btrblocks", "duckdb"]);
        assert_eq!(cfg.repository("fastlanes").unwrap().branch, "release_v0.1");
        let enabled: Vec<_> = cfg.enabled_invocations().map(|i| i.name.as_str()).collect();
        assert_eq!(enabled, vec!["bench_compression_ratio"]);
    }

    #[test]
    fn shipped_plans_only_enable_scripts_that_exist() {
        let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let shipped = fs::read_to_string(workspace.join(DEFAULT_CONFIG_FILE)).expect("harness.yaml");
        for raw in [DEFAULT_CONFIG_YAML, shipped.as_str()] {
            let cfg = HarnessConfig::from_yaml(raw).expect("plan");
            for inv in cfg.enabled_invocations() {
                if let InvocationKind::Script { script, .. } = &inv.kind {
                    let path = workspace.join(&cfg.scripts_dir).join(script);
                    assert!(path.is_file(), "{} enables missing {}", inv.name, path.display());
                }
            }
        }
    }

    #[test]
    fn command_inside_a_repository_depends_on_it() {
        let cfg = HarnessConfig::from_yaml(
            r#"
repositories:
  - { name: btrblocks, url: "file:///tmp/x", branch: main }
invocations:
  - { name: in_repo, kind: command, cwd: btrblocks, command: ["true"] }
  - { name: in_dir, kind: command, cwd: tools, command: ["true"] }
  - { name: explicit, kind: command, cwd: btrblocks, requires: [btrblocks], command: ["true"] }
"#,
        )
        .expect("parse");
        let required: Vec<_> = cfg
            .invocations
            .iter()
            .map(|i| i.required_repositories(&cfg.repositories))
            .collect();
        assert_eq!(required[0], vec!["btrblocks".to_string()]);
        assert!(required[1].is_empty());
        assert_eq!(required[2], vec!["btrblocks".to_string()]);
    }

    #[test]
    fn invocation_kinds_parse_from_yaml() {
        let cfg = HarnessConfig::from_yaml(
            r#"
repositories:
  - { name: fastlanes, url: "file:///tmp/x", branch: main }
invocations:
  - name: bench
    kind: cmake_target
    repository: fastlanes
    target: bench_compression_ratio
  - name: fail
    kind: command
    command: [sh, -c, "exit 1"]
    enabled: false
"#,
        )
        .expect("parse");
        match &cfg.invocations[0].kind {
            InvocationKind::CmakeTarget {
                build_dir, target, ..
            } => {
                assert_eq!(build_dir, "build");
                assert_eq!(target, "bench_compression_ratio");
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(cfg.invocations[0].enabled);
        assert!(!cfg.invocations[1].enabled);
        assert_eq!(
            cfg.invocations[0].required_repositories(&cfg.repositories),
            vec!["fastlanes".to_string()]
        );
        assert!(cfg.bootstrap.enabled);
        assert!(cfg.clean_results);
    }

    #[test]
    fn validate_reports_all_problems() {
        let err = HarnessConfig::from_yaml(
            r#"
repositories:
  - { name: a, url: "u", branch: main }
  - { name: a, url: "u", branch: "" }
invocations:
  - { name: repo_update, kind: command, command: ["true"] }
  - { name: "../x", kind: script, script: x.py }
  - { name: dup, kind: cmake_target, repository: nope, target: t }
  - { name: dup, kind: command, command: [] }
"#,
        )
        .expect_err("should fail");
        let msg = format!("{:#}", err);
        assert!(msg.contains("duplicate repository 'a'"), "{}", msg);
        assert!(msg.contains("repository 'a' has no branch"), "{}", msg);
        assert!(msg.contains("'repo_update' is reserved"), "{}", msg);
        assert!(msg.contains("'../x' is not a plain file name"), "{}", msg);
        assert!(msg.contains("requires unknown repository 'nope'"), "{}", msg);
        assert!(msg.contains("duplicate invocation 'dup'"), "{}", msg);
        assert!(msg.contains("has an empty command"), "{}", msg);
    }

    #[test]
    fn pinned_commit_detection() {
        let mut repo = RepositorySpec {
            name: "fastlanes".into(),
            url: "u".into(),
            branch: "release_v0.1".into(),
            dir: None,
        };
        assert!(!repo.is_pinned_commit());
        repo.branch = "0123456789abcdef0123456789abcdef01234567".into();
        assert!(repo.is_pinned_commit());
        assert_eq!(repo.local_dir(Path::new("/w")), PathBuf::from("/w/fastlanes"));
        repo.dir = Some("fl".into());
        assert_eq!(repo.local_dir(Path::new("/w")), PathBuf::from("/w/fl"));
    }

    #[test]
    fn select_only_keeps_order_and_rejects_unknown() {
        let mut cfg = HarnessConfig::builtin().expect("built-in config");
        cfg.select_only(&["popularity".into(), "btrblocks_total".into()])
            .expect("select");
        let enabled: Vec<_> = cfg.enabled_invocations().map(|i| i.name.as_str()).collect();
        assert_eq!(enabled, vec!["btrblocks_total", "popularity"]);
        assert!(cfg.select_only(&["nope".into()]).is_err());
    }

    #[test]
    fn load_falls_back_to_builtin() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_, source) = HarnessConfig::load(None, tmp.path()).expect("load");
        assert_eq!(source, ConfigSource::BuiltIn);

        fs::write(
            tmp.path().join(DEFAULT_CONFIG_FILE),
            "repositories: []\ninvocations: []\n",
        )
        .expect("write");
        let (cfg, source) = HarnessConfig::load(None, tmp.path()).expect("load");
        assert_eq!(source, ConfigSource::File(tmp.path().join(DEFAULT_CONFIG_FILE)));
        assert!(cfg.repositories.is_empty());

        assert!(HarnessConfig::load(Some(&tmp.path().join("missing.yaml")), tmp.path()).is_err());
    }
}
