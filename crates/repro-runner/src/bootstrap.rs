use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::BootstrapConfig;
use crate::error::EnvironmentError;
use crate::fsutil::{append_line, atomic_write_bytes, ensure_dir};
use crate::process::{run_step, StepCommand, StepOutput};

const MARKER_FILE: &str = ".repro-requirements";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Disabled,
    Reused,
    Created,
}

impl BootstrapOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapOutcome::Disabled => "disabled",
            BootstrapOutcome::Reused => "reused",
            BootstrapOutcome::Created => "created",
        }
    }
}

/// The interpreter that harness scripts run under.
#[derive(Debug, Clone)]
pub struct PythonEnv {
    pub python: PathBuf,
    pub venv: Option<PathBuf>,
    pub version: Option<String>,
    pub outcome: BootstrapOutcome,
}

impl PythonEnv {
    pub fn system(interpreter: &str) -> Self {
        Self {
            python: PathBuf::from(interpreter),
            venv: None,
            version: None,
            outcome: BootstrapOutcome::Disabled,
        }
    }

    /// Variables that activate the venv for a child process.
    pub fn activation_env(&self) -> Vec<(String, String)> {
        let Some(venv) = &self.venv else {
            return Vec::new();
        };
        let bin = venv_bin(venv);
        let path = match std::env::var_os("PATH") {
            Some(existing) => {
                let mut parts = vec![bin];
                parts.extend(std::env::split_paths(&existing));
                std::env::join_paths(parts)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default()
            }
            None => bin.to_string_lossy().to_string(),
        };
        vec![
            ("VIRTUAL_ENV".to_string(), venv.to_string_lossy().to_string()),
            ("PATH".to_string(), path),
        ]
    }
}

/// Create (or reuse) the isolated Python environment. Any error here is
/// fatal for the whole pipeline.
pub fn bootstrap(
    cfg: &BootstrapConfig,
    root: &Path,
    log: &Path,
) -> Result<PythonEnv, EnvironmentError> {
    if !cfg.enabled {
        info!(interpreter = %cfg.interpreter, "bootstrap disabled; using interpreter as-is");
        return Ok(PythonEnv::system(&cfg.interpreter));
    }
    if let Some(parent) = log.parent() {
        ensure_dir(parent)?;
    }
    fs::write(log, "")?;

    let probe = probe_version(&cfg.interpreter, root, log)?;
    if !version_at_least(&probe, &cfg.min_version) {
        return Err(EnvironmentError::InterpreterTooOld {
            interpreter: cfg.interpreter.clone(),
            found: probe,
            required: cfg.min_version.clone(),
        });
    }

    let venv = root.join(&cfg.venv_dir);
    let venv_python = venv_bin(&venv).join(python_exe());
    let marker = venv.join(MARKER_FILE);
    let digest = requirements_digest(cfg);

    let marker_matches = fs::read_to_string(&marker)
        .map(|s| s.trim() == digest)
        .unwrap_or(false);
    if marker_matches {
        if let Ok(version) = probe_version(&venv_python.to_string_lossy(), root, log) {
            info!(venv = %venv.display(), %version, "reusing virtual environment");
            return Ok(PythonEnv {
                python: venv_python,
                venv: Some(venv),
                version: Some(version),
                outcome: BootstrapOutcome::Reused,
            });
        }
    }

    info!(venv = %venv.display(), "creating virtual environment");
    let create = StepCommand::new(cfg.interpreter.clone(), root)
        .args(["-m", "venv"])
        .arg(venv.to_string_lossy().to_string());
    let out = logged(&create, log).map_err(|e| EnvironmentError::InterpreterMissing {
        interpreter: cfg.interpreter.clone(),
        message: e.to_string(),
    })?;
    if !out.success() {
        return Err(EnvironmentError::VenvCreation {
            path: venv,
            status: out.status_label(),
        });
    }

    if !cfg.requirements.is_empty() {
        info!(requirements = ?cfg.requirements, "installing dependencies");
        let install = StepCommand::new(venv_python.to_string_lossy().to_string(), root)
            .args(["-m", "pip", "install", "--disable-pip-version-check"])
            .args(cfg.requirements.iter().cloned());
        let out = logged(&install, log)?;
        if !out.success() {
            return Err(EnvironmentError::DependencyInstall {
                status: out.status_label(),
                log: log.to_path_buf(),
            });
        }
    }
    atomic_write_bytes(&marker, format!("{}\n", digest).as_bytes())?;

    Ok(PythonEnv {
        python: venv_python,
        venv: Some(venv),
        version: Some(probe),
        outcome: BootstrapOutcome::Created,
    })
}

fn probe_version(interpreter: &str, root: &Path, log: &Path) -> Result<String, EnvironmentError> {
    let missing = |message: String| EnvironmentError::InterpreterMissing {
        interpreter: interpreter.to_string(),
        message,
    };
    let cmd = StepCommand::new(interpreter, root).arg("--version");
    let out = logged(&cmd, log).map_err(|e| missing(e.to_string()))?;
    if !out.success() {
        return Err(missing(format!("--version exited {}", out.status_label())));
    }
    // Older interpreters print the banner on stderr.
    let banner = if out.stdout.trim().is_empty() {
        &out.stderr
    } else {
        &out.stdout
    };
    parse_python_version(banner).ok_or_else(|| missing(format!("unrecognised banner {:?}", banner.trim())))
}

fn logged(cmd: &StepCommand, log: &Path) -> std::io::Result<StepOutput> {
    let out = run_step(cmd)?;
    let mut rendered = String::new();
    out.render_into(&mut rendered);
    append_line(log, rendered.trim_end())?;
    Ok(out)
}

/// `"Python 3.11.4"` -> `"3.11.4"`.
fn parse_python_version(banner: &str) -> Option<String> {
    let version = banner.trim().strip_prefix("Python ")?.split_whitespace().next()?;
    version_tuple(version)?;
    Some(version.to_string())
}

fn version_tuple(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()
        .map(|m| {
            m.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    Some((major, minor))
}

fn version_at_least(found: &str, required: &str) -> bool {
    match (version_tuple(found), version_tuple(required)) {
        (Some(f), Some(r)) => f >= r,
        (_, None) => true,
        (None, Some(_)) => false,
    }
}

fn requirements_digest(cfg: &BootstrapConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cfg.interpreter.as_bytes());
    hasher.update(b"\n");
    hasher.update(cfg.min_version.as_bytes());
    for req in &cfg.requirements {
        hasher.update(b"\n");
        hasher.update(req.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(windows)]
fn venv_bin(venv: &Path) -> PathBuf {
    venv.join("Scripts")
}

#[cfg(not(windows))]
fn venv_bin(venv: &Path) -> PathBuf {
    venv.join("bin")
}

#[cfg(windows)]
fn python_exe() -> &'static str {
    "python.exe"
}

#[cfg(not(windows))]
fn python_exe() -> &'static str {
    "python"
}
