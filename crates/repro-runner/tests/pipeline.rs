#![cfg(unix)]

use repro_runner::{
    dump_logs, run_pipeline, ConfigSource, HarnessConfig, InvocationStatus, PipelineOptions,
    SyncAction, SyncError,
};
use std::fs;
use std::path::{Path, PathBuf};

const REPOS: [&str; 4] = ["fastlanes", "data_repo", "btrblocks", "duckdb"];

fn git(dir: &Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
        .args(["-c", "user.name=repro", "-c", "user.email=repro@example.invalid"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git available");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn commit(dir: &Path, file: &str, msg: &str) -> String {
    fs::write(dir.join(file), msg).expect("write");
    git(dir, &["add", file]);
    git(dir, &["commit", "-q", "-m", msg]);
    git(dir, &["rev-parse", "HEAD"])
}

/// One upstream per default repository, each with a single commit on `main`.
fn upstreams(base: &Path) -> Vec<(String, PathBuf)> {
    REPOS
        .iter()
        .map(|name| {
            let dir = base.join("upstream").join(name);
            fs::create_dir_all(&dir).expect("mkdir");
            git(&dir, &["init", "-q"]);
            git(&dir, &["checkout", "-q", "-b", "main"]);
            commit(&dir, "README", &format!("{} initial", name));
            (name.to_string(), dir)
        })
        .collect()
}

fn harness(upstreams: &[(String, PathBuf)], invocations: &str) -> HarnessConfig {
    let mut yaml = String::from("bootstrap:\n  enabled: false\n  interpreter: python3\nrepositories:\n");
    for (name, url) in upstreams {
        yaml.push_str(&format!(
            "  - name: {}\n    url: \"{}\"\n    branch: main\n",
            name,
            url.display()
        ));
    }
    yaml.push_str(invocations);
    HarnessConfig::from_yaml(&yaml).expect("config")
}

fn run(config: &HarnessConfig, root: &Path) -> repro_runner::PipelineReport {
    run_pipeline(config, &ConfigSource::BuiltIn, root, &PipelineOptions::default())
        .expect("pipeline")
}

#[test]
fn empty_plan_clones_every_repository() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ups = upstreams(tmp.path());
    let root = tmp.path().join("harness");
    let config = harness(&ups, "invocations: []\n");

    let report = run(&config, &root);
    assert!(report.succeeded(), "{:?}", report.summary_lines());
    assert!(report.invocations.is_empty());
    for name in REPOS {
        assert!(root.join(name).join("README").is_file(), "{} cloned", name);
    }
    assert!(root.join("logs/repo_update.log").is_file());
    assert!(root.join("logs/system_info.log").is_file());
    assert!(root.join("result").is_dir());

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(root.join("logs/run_summary.json")).expect("read"))
            .expect("json");
    assert_eq!(summary["ok"], true);
    assert_eq!(summary["repositories"].as_array().map(Vec::len), Some(4));
}

#[test]
fn rerun_is_idempotent() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ups = upstreams(tmp.path());
    let root = tmp.path().join("harness");
    let config = harness(
        &ups,
        r#"invocations:
  - name: write_table
    kind: command
    command: ["sh", "-c", "echo 1,2 > \"$REPRO_RESULT_DIR/table.csv\""]
"#,
    );

    let first = run(&config, &root);
    assert!(first.succeeded());
    assert!(first
        .repositories
        .iter()
        .all(|r| matches!(&r.outcome, Ok(o) if o.action == SyncAction::Cloned)));

    let second = run(&config, &root);
    assert!(second.succeeded());
    for (a, b) in first.repositories.iter().zip(&second.repositories) {
        let (a, b) = (a.outcome.as_ref().expect("ok"), b.outcome.as_ref().expect("ok"));
        assert_eq!(b.action, SyncAction::UpToDate);
        assert_eq!(a.commit, b.commit);
    }
    assert_eq!(
        fs::read_to_string(root.join("result/write_table/table.csv")).expect("read"),
        "1,2\n"
    );
}

#[test]
fn failing_invocation_is_logged_and_later_ones_still_run() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ups = upstreams(tmp.path());
    let root = tmp.path().join("harness");
    let config = harness(
        &ups,
        r#"invocations:
  - name: broken
    kind: command
    command: ["sh", "-c", "echo about to fail; echo bad input >&2; exit 1"]
  - name: after
    kind: command
    cwd: fastlanes
    command: ["sh", "-c", "cat README > \"$REPRO_RESULT_DIR/readme.txt\""]
"#,
    );

    let report = run(&config, &root);
    assert!(!report.succeeded());
    assert_eq!(report.invocations.len(), 2);
    assert_eq!(report.invocations[0].status, InvocationStatus::Failed);
    assert_eq!(report.invocations[0].exit_code, Some(1));
    assert_eq!(report.invocations[1].status, InvocationStatus::Succeeded);
    assert_eq!(
        fs::read_to_string(root.join("result/after/readme.txt")).expect("read"),
        "fastlanes initial"
    );

    let log = fs::read_to_string(root.join("logs/broken.log")).expect("log");
    assert!(log.contains("about to fail"));
    assert!(log.contains("bad input"));
    assert!(log.contains("status=failed"));
    assert!(report
        .summary_lines()
        .iter()
        .any(|l| l.contains("FAILED invocation broken")));

    let mut dumped = Vec::new();
    dump_logs(&root.join("logs"), &mut dumped).expect("dump");
    let dumped = String::from_utf8(dumped).expect("utf8");
    assert!(dumped.contains("===== broken.log ====="));
    assert!(dumped.contains("about to fail"));
}

#[test]
fn diverged_repository_fails_alone_and_skips_its_dependents() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ups = upstreams(tmp.path());
    let root = tmp.path().join("harness");
    let config = harness(
        &ups,
        r#"invocations:
  - name: btrblocks_total
    kind: command
    requires: [btrblocks]
    command: ["true"]
  - name: plot_from_data
    kind: command
    requires: [data_repo]
    command: ["true"]
"#,
    );
    assert!(run(&config, &root).succeeded());

    let btr_upstream = &ups.iter().find(|(n, _)| n == "btrblocks").expect("btrblocks").1;
    commit(btr_upstream, "upstream.txt", "upstream change");
    let local = commit(&root.join("btrblocks"), "local.txt", "local change");
    let data_upstream = &ups.iter().find(|(n, _)| n == "data_repo").expect("data_repo").1;
    let newer = commit(data_upstream, "new.csv", "more data");

    let report = run(&config, &root);
    assert!(!report.succeeded());

    let btr = report
        .repositories
        .iter()
        .find(|r| r.name == "btrblocks")
        .expect("btrblocks");
    assert!(matches!(btr.outcome, Err(SyncError::Diverged { .. })));
    assert_eq!(git(&root.join("btrblocks"), &["rev-parse", "HEAD"]), local);

    let data = report
        .repositories
        .iter()
        .find(|r| r.name == "data_repo")
        .expect("data_repo");
    let data = data.outcome.as_ref().expect("data_repo synced");
    assert_eq!(data.action, SyncAction::Updated);
    assert_eq!(data.commit, newer);
    assert_eq!(report.failed_repositories().count(), 1);

    assert_eq!(report.invocations[0].status, InvocationStatus::Skipped);
    assert_eq!(report.invocations[1].status, InvocationStatus::Succeeded);
    let update_log = fs::read_to_string(root.join("logs/repo_update.log")).expect("log");
    assert!(update_log.contains("btrblocks FAILED"));
}
