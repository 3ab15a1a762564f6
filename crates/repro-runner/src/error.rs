use std::path::PathBuf;

use thiserror::Error;

/// Failures that prevent the pipeline from starting at all.
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("interpreter '{interpreter}' not found or not runnable: {message}")]
    InterpreterMissing { interpreter: String, message: String },
    #[error("interpreter '{interpreter}' reports version {found}, need >= {required}")]
    InterpreterTooOld {
        interpreter: String,
        found: String,
        required: String,
    },
    #[error("could not create virtual environment at {path:?} (exit {status})")]
    VenvCreation { path: PathBuf, status: String },
    #[error("dependency install failed (exit {status}); see {log:?}")]
    DependencyInstall { status: String, log: PathBuf },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-repository synchronization failure. Never aborts other repositories.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{path:?} exists but is not a git checkout with an 'origin' remote")]
    NotARepository { path: PathBuf },
    #[error("{path:?} has local modifications; refusing to update")]
    Dirty { path: PathBuf },
    #[error("branch '{branch}' in {path:?} cannot be fast-forwarded to origin/{branch}")]
    Diverged { path: PathBuf, branch: String },
    #[error("git {step} failed (exit {status}): {stderr}")]
    Git {
        step: String,
        status: String,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a single invocation did not succeed.
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("{step} exited with status {status}")]
    NonZeroExit { step: String, status: String },
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("script not found: {0:?}")]
    ScriptMissing(PathBuf),
    #[error("no executable named '{target}' under {build_dir:?}")]
    TargetNotFound { target: String, build_dir: PathBuf },
    #[error("unknown repository '{0}'")]
    UnknownRepository(String),
    #[error("expected results not found at {0:?}")]
    ResultsMissing(PathBuf),
    #[error("collector error: {0}")]
    Collector(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

