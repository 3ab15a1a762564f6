use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::bootstrap::PythonEnv;
use crate::host::HostInfo;
use crate::invoke::{InvocationRecord, InvocationStatus};
use crate::sync::RepoSync;

/// Outcome of one full bootstrap → sync → run pass.
#[derive(Debug)]
pub struct PipelineReport {
    pub root: PathBuf,
    pub config_source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub python: PythonEnv,
    pub host: HostInfo,
    pub repositories: Vec<RepoSync>,
    pub invocations: Vec<InvocationRecord>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.repositories.iter().all(RepoSync::is_ok)
            && self.invocations.iter().all(InvocationRecord::succeeded)
    }

    pub fn failed_repositories(&self) -> impl Iterator<Item = &RepoSync> {
        self.repositories.iter().filter(|r| !r.is_ok())
    }

    pub fn failed_invocations(&self) -> impl Iterator<Item = &InvocationRecord> {
        self.invocations.iter().filter(|i| !i.succeeded())
    }

    /// Human-readable end-of-run summary, one line per entry.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let ok_invocations = self.invocations.iter().filter(|i| i.succeeded()).count();
        lines.push(format!(
            "repositories: {}/{} synchronized",
            self.repositories.iter().filter(|r| r.is_ok()).count(),
            self.repositories.len()
        ));
        lines.push(format!(
            "invocations: {}/{} succeeded",
            ok_invocations,
            self.invocations.len()
        ));
        for repo in self.failed_repositories() {
            if let Err(e) = &repo.outcome {
                lines.push(format!("  FAILED repository {}: {}", repo.name, e));
            }
        }
        for inv in self.failed_invocations() {
            let tag = match inv.status {
                InvocationStatus::Skipped => "SKIPPED",
                _ => "FAILED",
            };
            lines.push(format!(
                "  {} invocation {}: {} (log: {})",
                tag,
                inv.name,
                inv.detail.as_deref().unwrap_or("unknown error"),
                inv.log_path.display()
            ));
        }
        lines.push(format!(
            "status: {}",
            if self.succeeded() { "success" } else { "failed" }
        ));
        lines
    }

    pub fn to_json(&self) -> Value {
        json!({
            "schema_version": "repro_run_summary_v1",
            "root": self.root.display().to_string(),
            "config": self.config_source,
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
            "ok": self.succeeded(),
            "python": {
                "interpreter": self.python.python.display().to_string(),
                "venv": self.python.venv.as_ref().map(|p| p.display().to_string()),
                "version": self.python.version,
                "bootstrap": self.python.outcome.as_str(),
            },
            "host": self.host.to_json(),
            "repositories": self.repositories.iter().map(RepoSync::to_json).collect::<Vec<_>>(),
            "invocations": self.invocations.iter().map(InvocationRecord::to_json).collect::<Vec<_>>(),
        })
    }
}
