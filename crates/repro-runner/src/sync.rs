//! Clone-or-fast-forward of the external repositories.
//!
//! Every git step is appended to `logs/repo_update.log` together with one
//! summary line per repository. History is never rewritten: a branch that
//! cannot be fast-forwarded, or a checkout with local edits to tracked files,
//! is reported as an error for that repository only.

use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::RepositorySpec;
use crate::error::SyncError;
use crate::fsutil::{append_line, ensure_dir};
use crate::process::{run_step, StepCommand, StepOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Cloned,
    Updated,
    UpToDate,
    Pinned,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Cloned => "cloned",
            SyncAction::Updated => "updated",
            SyncAction::UpToDate => "up_to_date",
            SyncAction::Pinned => "pinned",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub action: SyncAction,
    pub previous: Option<String>,
    pub commit: String,
    pub subject: String,
}

#[derive(Debug)]
pub struct RepoSync {
    pub name: String,
    pub dir: PathBuf,
    pub branch: String,
    pub outcome: Result<SyncOutcome, SyncError>,
}

impl RepoSync {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn to_json(&self) -> Value {
        match &self.outcome {
            Ok(o) => json!({
                "repository": self.name,
                "dir": self.dir.display().to_string(),
                "branch": self.branch,
                "ok": true,
                "action": o.action.as_str(),
                "previous": o.previous,
                "commit": o.commit,
                "subject": o.subject,
            }),
            Err(e) => json!({
                "repository": self.name,
                "dir": self.dir.display().to_string(),
                "branch": self.branch,
                "ok": false,
                "error": e.to_string(),
            }),
        }
    }
}

/// Synchronize every repository in order. One failure never stops the rest.
pub fn sync_all(repos: &[RepositorySpec], root: &Path, update_log: &Path) -> Vec<RepoSync> {
    repos
        .iter()
        .map(|repo| {
            let dir = repo.local_dir(root);
            let outcome = sync_repository(repo, root, update_log);
            let line = match &outcome {
                Ok(o) => {
                    info!(
                        repository = %repo.name,
                        action = o.action.as_str(),
                        commit = %short(&o.commit),
                        "synchronized"
                    );
                    format!(
                        "{} {} {} branch={} commit={} subject={:?}",
                        Utc::now().to_rfc3339(),
                        repo.name,
                        o.action.as_str(),
                        repo.branch,
                        o.commit,
                        o.subject
                    )
                }
                Err(e) => {
                    error!(repository = %repo.name, error = %e, "synchronization failed");
                    format!(
                        "{} {} FAILED branch={} error={}",
                        Utc::now().to_rfc3339(),
                        repo.name,
                        repo.branch,
                        e
                    )
                }
            };
            if let Err(e) = append_line(update_log, &line) {
                warn!(error = %e, "could not append to {}", update_log.display());
            }
            RepoSync {
                name: repo.name.clone(),
                dir,
                branch: repo.branch.clone(),
                outcome,
            }
        })
        .collect()
}

pub fn sync_repository(
    repo: &RepositorySpec,
    root: &Path,
    update_log: &Path,
) -> Result<SyncOutcome, SyncError> {
    let dir = repo.local_dir(root);
    if dir.exists() {
        info!(repository = %repo.name, "checking for updates");
        update_existing(repo, &dir, update_log)
    } else {
        info!(repository = %repo.name, url = %repo.url, "cloning");
        clone_fresh(repo, &dir, update_log)
    }
}

fn clone_fresh(repo: &RepositorySpec, dir: &Path, log: &Path) -> Result<SyncOutcome, SyncError> {
    let parent = dir.parent().unwrap_or(Path::new("."));
    ensure_dir(parent)?;
    let target = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| SyncError::NotARepository {
            path: dir.to_path_buf(),
        })?;
    let outer = Git::new(parent, log);
    if repo.is_pinned_commit() {
        outer.check("clone", &["clone", &repo.url, &target])?;
    } else {
        outer.check(
            "clone",
            &["clone", "--branch", &repo.branch, &repo.url, &target],
        )?;
    }

    let git = Git::new(dir, log);
    let action = if repo.is_pinned_commit() {
        git.check("checkout", &["checkout", "--detach", &repo.branch])?;
        SyncAction::Pinned
    } else {
        SyncAction::Cloned
    };
    let (commit, subject) = git.head()?;
    Ok(SyncOutcome {
        action,
        previous: None,
        commit,
        subject,
    })
}

fn update_existing(
    repo: &RepositorySpec,
    dir: &Path,
    log: &Path,
) -> Result<SyncOutcome, SyncError> {
    let git = Git::new(dir, log);
    git.ensure_checkout_root()?;

    let status = git.check("status", &["status", "--porcelain", "--untracked-files=no"])?;
    if !status.stdout.trim().is_empty() {
        return Err(SyncError::Dirty {
            path: dir.to_path_buf(),
        });
    }

    let (previous, _) = git.head()?;

    if repo.is_pinned_commit() {
        git.check("fetch", &["fetch", "origin"])?;
        git.check("checkout", &["checkout", "--detach", &repo.branch])?;
        let (commit, subject) = git.head()?;
        let action = if commit == previous {
            SyncAction::UpToDate
        } else {
            SyncAction::Pinned
        };
        return Ok(SyncOutcome {
            action,
            previous: Some(previous),
            commit,
            subject,
        });
    }

    let remote_ref = format!("refs/remotes/origin/{}", repo.branch);
    let refspec = format!("+refs/heads/{}:{}", repo.branch, remote_ref);
    git.check("fetch", &["fetch", "origin", &refspec])?;
    git.check("checkout", &["checkout", &repo.branch])?;

    let (local_head, _) = git.head()?;
    let ancestry = git.run("merge-base", &["merge-base", "--is-ancestor", "HEAD", &remote_ref])?;
    match ancestry.exit_code {
        Some(0) => {}
        Some(1) => {
            return Err(SyncError::Diverged {
                path: dir.to_path_buf(),
                branch: repo.branch.clone(),
            })
        }
        _ => return Err(git_failure("merge-base", &ancestry)),
    }
    git.check("merge", &["merge", "--ff-only", &remote_ref])?;

    let (commit, subject) = git.head()?;
    let action = if commit == previous && commit == local_head {
        SyncAction::UpToDate
    } else {
        SyncAction::Updated
    };
    Ok(SyncOutcome {
        action,
        previous: Some(previous),
        commit,
        subject,
    })
}

struct Git<'a> {
    dir: PathBuf,
    log: &'a Path,
}

impl<'a> Git<'a> {
    fn new(dir: &Path, log: &'a Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            log,
        }
    }

    /// Run `git <args>` and log it; the exit status is left to the caller.
    fn run(&self, step: &str, args: &[&str]) -> Result<StepOutput, SyncError> {
        let cmd = StepCommand::new("git", &self.dir)
            .args(args.iter().copied())
            .envs(&[("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]);
        let out = run_step(&cmd).map_err(|e| SyncError::Git {
            step: step.to_string(),
            status: "spawn".to_string(),
            stderr: e.to_string(),
        })?;
        let mut rendered = String::new();
        out.render_into(&mut rendered);
        append_line(self.log, rendered.trim_end())?;
        Ok(out)
    }

    fn check(&self, step: &str, args: &[&str]) -> Result<StepOutput, SyncError> {
        let out = self.run(step, args)?;
        if out.success() {
            Ok(out)
        } else {
            Err(git_failure(step, &out))
        }
    }

    fn head(&self) -> Result<(String, String), SyncError> {
        let commit = self.check("rev-parse", &["rev-parse", "HEAD"])?;
        let subject = self.check("log", &["log", "-1", "--pretty=%s"])?;
        Ok((
            commit.stdout.trim().to_string(),
            subject.stdout.trim().to_string(),
        ))
    }

    /// The directory must be the top of its own work tree and have an
    /// `origin`; otherwise git would act on an enclosing repository.
    fn ensure_checkout_root(&self) -> Result<(), SyncError> {
        let not_repo = || SyncError::NotARepository {
            path: self.dir.clone(),
        };
        let top = self.run("rev-parse", &["rev-parse", "--show-toplevel"])?;
        if !top.success() {
            return Err(not_repo());
        }
        let top = PathBuf::from(top.stdout.trim());
        let same = match (top.canonicalize(), self.dir.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if !same {
            return Err(not_repo());
        }
        let origin = self.run("remote", &["remote", "get-url", "origin"])?;
        if !origin.success() {
            return Err(not_repo());
        }
        Ok(())
    }
}

fn git_failure(step: &str, out: &StepOutput) -> SyncError {
    SyncError::Git {
        step: step.to_string(),
        status: out.status_label(),
        stderr: out.stderr.trim().to_string(),
    }
}

pub fn short(commit: &str) -> &str {
    commit.get(..7).unwrap_or(commit)
}
