use serde_json::{json, Value};
use std::fmt::Write as _;
use sysinfo::System;

/// Machine description recorded next to the benchmark logs; SIMD support
/// decides which of the paper's numbers are comparable.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub os: String,
    pub os_version: String,
    pub kernel: String,
    pub hostname: String,
    pub arch: String,
    pub cpu_brand: String,
    pub logical_cpus: usize,
    pub physical_cores: Option<usize>,
    pub memory_mb: u64,
    pub avx2: bool,
    pub avx512f: bool,
}

impl HostInfo {
    pub fn detect() -> Self {
        let sys = System::new_all();
        let (avx2, avx512f) = simd_support();
        Self {
            os: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            os_version: System::os_version().unwrap_or_default(),
            kernel: System::kernel_version().unwrap_or_default(),
            hostname: System::host_name().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_brand: sys
                .cpus()
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
            logical_cpus: sys.cpus().len(),
            physical_cores: sys.physical_core_count(),
            memory_mb: sys.total_memory() / (1024 * 1024),
            avx2,
            avx512f,
        }
    }

    pub fn render(&self) -> String {
        let yes_no = |b: bool| if b { "Yes" } else { "No" };
        let mut out = String::new();
        let _ = writeln!(out, "========== System Information ==========");
        let _ = writeln!(out, "Operating System   : {}", self.os);
        let _ = writeln!(out, "OS Version         : {}", self.os_version);
        let _ = writeln!(out, "Kernel             : {}", self.kernel);
        let _ = writeln!(out, "Host               : {}", self.hostname);
        let _ = writeln!(out, "Machine            : {}", self.arch);
        let _ = writeln!(out, "Processor          : {}", self.cpu_brand);
        let _ = writeln!(out, "CPU Count          : {}", self.logical_cpus);
        if let Some(cores) = self.physical_cores {
            let _ = writeln!(out, "Physical Cores     : {}", cores);
        }
        let _ = writeln!(out, "Memory (MiB)       : {}", self.memory_mb);
        let _ = writeln!(out, "AVX2 support       : {}", yes_no(self.avx2));
        let _ = writeln!(out, "AVX-512 support    : {}", yes_no(self.avx512f));
        let _ = writeln!(out, "========================================");
        out
    }

    pub fn to_json(&self) -> Value {
        json!({
            "os": self.os,
            "os_version": self.os_version,
            "kernel": self.kernel,
            "hostname": self.hostname,
            "arch": self.arch,
            "cpu_brand": self.cpu_brand,
            "logical_cpus": self.logical_cpus,
            "physical_cores": self.physical_cores,
            "memory_mb": self.memory_mb,
            "avx2": self.avx2,
            "avx512f": self.avx512f,
        })
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn simd_support() -> (bool, bool) {
    (
        std::arch::is_x86_feature_detected!("avx2"),
        std::arch::is_x86_feature_detected!("avx512f"),
    )
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn simd_support() -> (bool, bool) {
    (false, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_fills_basic_fields() {
        let info = HostInfo::detect();
        assert_eq!(info.arch, std::env::consts::ARCH);
        assert!(!info.os.is_empty());
        let text = info.render();
        assert!(text.starts_with("========== System Information"));
        assert!(text.contains("AVX2 support"));
        assert_eq!(info.to_json()["arch"], info.arch.as_str());
    }
}
