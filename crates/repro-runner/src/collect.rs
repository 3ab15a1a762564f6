use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use zip::write::FileOptions;

use crate::config::{BOOTSTRAP_LOG, LOG_DIR, REPO_UPDATE_LOG, RESULT_DIR, RUN_SUMMARY, SYSTEM_INFO_LOG};
use crate::fsutil::{clear_dir, ensure_dir, list_files};

/// Owns `logs/` and the scoping of `result/<name>/`. It never moves or
/// renames what an invocation writes into its result directory.
#[derive(Debug, Clone)]
pub struct Collector {
    log_dir: PathBuf,
    result_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct InvocationPaths {
    pub log: PathBuf,
    pub result: PathBuf,
}

impl Collector {
    pub fn new(root: &Path) -> Self {
        Self {
            log_dir: root.join(LOG_DIR),
            result_dir: root.join(RESULT_DIR),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn repo_update_log(&self) -> PathBuf {
        self.log_dir.join(REPO_UPDATE_LOG)
    }

    pub fn bootstrap_log(&self) -> PathBuf {
        self.log_dir.join(BOOTSTRAP_LOG)
    }

    pub fn system_info_log(&self) -> PathBuf {
        self.log_dir.join(SYSTEM_INFO_LOG)
    }

    pub fn run_summary(&self) -> PathBuf {
        self.log_dir.join(RUN_SUMMARY)
    }

    /// Create `logs/` and `result/`; with `clean_results`, empty `result/`
    /// so the run only contains its own artifacts.
    pub fn prepare_workspace(&self, clean_results: bool) -> std::io::Result<()> {
        ensure_dir(&self.log_dir)?;
        if clean_results {
            let removed = clear_dir(&self.result_dir)?;
            if removed > 0 {
                info!(removed, dir = %self.result_dir.display(), "cleaned result directory");
            }
        } else {
            ensure_dir(&self.result_dir)?;
        }
        Ok(())
    }

    pub fn paths_for(&self, name: &str) -> InvocationPaths {
        InvocationPaths {
            log: self.log_dir.join(format!("{}.log", name)),
            result: self.result_dir.join(name),
        }
    }

    /// Guarantee both directories for one invocation, whatever state they
    /// were left in.
    pub fn prepare_invocation(&self, name: &str) -> std::io::Result<InvocationPaths> {
        let paths = self.paths_for(name);
        ensure_dir(&self.log_dir)?;
        ensure_dir(&paths.result)?;
        Ok(paths)
    }

    /// Replace the invocation's log; logs are never merged across runs.
    pub fn write_log(&self, paths: &InvocationPaths, text: &str) -> std::io::Result<()> {
        ensure_dir(&self.log_dir)?;
        fs::write(&paths.log, text)
    }
}

/// Print every file below `log_dir` (sorted, recursive) with a header line.
/// Returns how many files were printed.
pub fn dump_logs<W: Write>(log_dir: &Path, out: &mut W) -> std::io::Result<usize> {
    if !log_dir.is_dir() {
        writeln!(out, "No log directory at {}", log_dir.display())?;
        return Ok(0);
    }
    let files = list_files(log_dir);
    for file in &files {
        let rel = file.strip_prefix(log_dir).unwrap_or(file);
        writeln!(out, "===== {} =====", rel.display())?;
        let bytes = fs::read(file)?;
        out.write_all(String::from_utf8_lossy(&bytes).as_bytes())?;
        if !bytes.ends_with(b"\n") {
            writeln!(out)?;
        }
    }
    Ok(files.len())
}

/// Zip `logs/` and `result/` under `root` into `out_path`. Returns the
/// number of files archived.
pub fn bundle(root: &Path, out_path: &Path) -> Result<usize> {
    if let Some(parent) = out_path.parent() {
        ensure_dir(parent)?;
    }
    let file = fs::File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let out_abs = out_path.canonicalize().unwrap_or_else(|_| out_path.to_path_buf());

    let mut count = 0;
    for dir in [LOG_DIR, RESULT_DIR] {
        let base = root.join(dir);
        if !base.is_dir() {
            continue;
        }
        for file in list_files(&base) {
            if file.canonicalize().map(|p| p == out_abs).unwrap_or(false) {
                continue;
            }
            let rel = file.strip_prefix(root).unwrap_or(&file);
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            zip.start_file(name, options)?;
            zip.write_all(&fs::read(&file)?)?;
            count += 1;
        }
    }
    zip.finish()?;
    info!(files = count, bundle = %out_path.display(), "wrote bundle");
    Ok(count)
}
