use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

/// One external command, described as data so it can be logged verbatim.
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl StepCommand {
    pub fn new(program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &[(String, String)]) -> Self {
        self.env.extend_from_slice(env);
        self
    }

    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub command_line: String,
    pub cwd: PathBuf,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn status_label(&self) -> String {
        self.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }

    /// Append this step's section to a plain-text log buffer.
    pub fn render_into(&self, buf: &mut String) {
        let _ = writeln!(buf, "Command: {}", self.command_line);
        let _ = writeln!(buf, "Working directory: {}", self.cwd.display());
        let _ = writeln!(buf, "Exit status: {}", self.status_label());
        let _ = writeln!(buf, "Duration: {:.3}s", self.duration.as_secs_f64());
        let _ = writeln!(buf, "Output:\n{}", self.stdout);
        if !self.stderr.is_empty() {
            let _ = writeln!(buf, "Errors:\n{}", self.stderr);
        }
        let _ = writeln!(buf, "{}", "-".repeat(50));
    }
}

/// Run to completion, capturing stdout and stderr. Only a failure to start
/// the process is an `Err`; a non-zero exit is reported in the output.
pub fn run_step(step: &StepCommand) -> std::io::Result<StepOutput> {
    debug!(command = %step.command_line(), cwd = %step.cwd.display(), "spawning");
    let mut cmd = Command::new(&step.program);
    cmd.args(&step.args);
    cmd.current_dir(&step.cwd);
    for (k, v) in &step.env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let started = Instant::now();
    let output = cmd.output()?;
    Ok(StepOutput {
        command_line: step.command_line(),
        cwd: step.cwd.clone(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
    })
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
