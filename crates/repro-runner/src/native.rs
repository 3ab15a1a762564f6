use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::fsutil::{atomic_write_bytes, find_executable};
use crate::process::StepCommand;

const CONFIGURE_MARKER: &str = ".repro-configure";

/// How a native target of an external repository gets configured, built and
/// found. The runner executes and logs the returned steps itself.
pub trait BuildSystem {
    /// `None` when the build directory is already configured with `args`.
    fn configure_step(&self, source: &Path, build_dir: &Path, args: &[String])
        -> Option<StepCommand>;
    /// Called after a successful configure step.
    fn mark_configured(&self, _build_dir: &Path, _args: &[String]) -> std::io::Result<()> {
        Ok(())
    }
    fn build_step(&self, build_dir: &Path, target: &str, jobs: usize) -> StepCommand;
    fn locate(&self, build_dir: &Path, target: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct Cmake {
    pub program: String,
    pub build_type: String,
}

impl Default for Cmake {
    fn default() -> Self {
        Self {
            program: "cmake".to_string(),
            build_type: "Release".to_string(),
        }
    }
}

impl Cmake {
    /// Digest of everything that shapes the cache; a change forces a
    /// reconfigure of an existing build directory.
    fn args_digest(&self, args: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.build_type.as_bytes());
        for arg in args {
            hasher.update([0u8]);
            hasher.update(arg.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl BuildSystem for Cmake {
    fn configure_step(
        &self,
        source: &Path,
        build_dir: &Path,
        args: &[String],
    ) -> Option<StepCommand> {
        let marker = fs::read_to_string(build_dir.join(CONFIGURE_MARKER)).unwrap_or_default();
        if build_dir.join("CMakeCache.txt").exists() && marker.trim() == self.args_digest(args) {
            return None;
        }
        Some(
            StepCommand::new(self.program.clone(), source)
                .arg("-S")
                .arg(source.to_string_lossy().to_string())
                .arg("-B")
                .arg(build_dir.to_string_lossy().to_string())
                .arg(format!("-DCMAKE_BUILD_TYPE={}", self.build_type))
                .args(args.iter().cloned()),
        )
    }

    fn mark_configured(&self, build_dir: &Path, args: &[String]) -> std::io::Result<()> {
        atomic_write_bytes(
            &build_dir.join(CONFIGURE_MARKER),
            format!("{}\n", self.args_digest(args)).as_bytes(),
        )
    }

    fn build_step(&self, build_dir: &Path, target: &str, jobs: usize) -> StepCommand {
        StepCommand::new(self.program.clone(), build_dir)
            .arg("--build")
            .arg(build_dir.to_string_lossy().to_string())
            .args(["--config", &self.build_type, "--target", target])
            .arg("-j")
            .arg(jobs.to_string())
    }

    fn locate(&self, build_dir: &Path, target: &str) -> Option<PathBuf> {
        find_executable(build_dir, target)
    }
}
