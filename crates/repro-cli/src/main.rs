use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use repro_runner::config::{DEFAULT_CONFIG_FILE, DEFAULT_CONFIG_YAML, LOG_DIR};
use repro_runner::{
    CleanTargets, PipelineOptions, PipelineReport, PlanSummary, RepoSync, SyncAction,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "repro",
    version,
    about = "Reproduce the FastLanes benchmark results"
)]
struct Cli {
    /// Defaults to `run` with no options.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap, synchronize repositories and run every enabled invocation.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long = "only")]
        only: Vec<String>,
        #[arg(long)]
        skip_bootstrap: bool,
        #[arg(long)]
        json: bool,
    },
    Sync {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Bootstrap {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Print the resolved plan without running anything.
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    DumpLogs {
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    Init {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        force: bool,
    },
    Clean {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        logs: bool,
        #[arg(long)]
        results: bool,
        #[arg(long)]
        repos: bool,
        #[arg(long)]
        venv: bool,
    },
    Bundle {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Run {
            config: None,
            root: PathBuf::from("."),
            only: Vec::new(),
            skip_bootstrap: false,
            json: false,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_default();
    let json_mode = command_json_mode(&command);
    let result = run_command(command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            root,
            only,
            skip_bootstrap,
            json,
        } => {
            let (cfg, source) = repro_runner::load_plan(config.as_deref(), &root, &only)?;
            let options = PipelineOptions { skip_bootstrap };
            let report = repro_runner::run_pipeline(&cfg, &source, &root, &options)?;
            if json {
                let mut payload = report.to_json();
                payload["command"] = json!("run");
                if !report.succeeded() {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            print_report(&report);
            if !report.succeeded() {
                tracing::warn!("run finished with failures; `repro dump-logs` prints every log");
                std::process::exit(1);
            }
        }
        Commands::Sync { config, root, json } => {
            let (cfg, _) = repro_runner::load_plan(config.as_deref(), &root, &[])?;
            let repos = repro_runner::sync_repositories(&cfg, &root)?;
            let ok = repos.iter().all(RepoSync::is_ok);
            if json {
                let payload = json!({
                    "ok": ok,
                    "command": "sync",
                    "repositories": repos.iter().map(RepoSync::to_json).collect::<Vec<_>>(),
                });
                if !ok {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            for repo in &repos {
                println!("{}", sync_line(repo));
            }
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Bootstrap { config, root } => {
            let (cfg, _) = repro_runner::load_plan(config.as_deref(), &root, &[])?;
            repro_runner::fsutil::ensure_dir(&root.join(LOG_DIR))?;
            let env = repro_runner::bootstrap_environment(&cfg, &root, false)?;
            println!("bootstrap: {}", env.outcome.as_str());
            println!("python: {}", env.python.display());
            if let Some(version) = &env.version {
                println!("version: {}", version);
            }
        }
        Commands::Describe { config, root, json } => {
            let (cfg, source) = repro_runner::load_plan(config.as_deref(), &root, &[])?;
            let plan = repro_runner::describe_plan(&cfg, &source, &root);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "plan": plan_to_json(&plan)
                })));
            }
            print_plan(&plan);
        }
        Commands::DumpLogs { root } => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            repro_runner::dump_logs(&root.join(LOG_DIR), &mut out)?;
        }
        Commands::Init { root, force } => {
            let path = root.join(DEFAULT_CONFIG_FILE);
            if path.exists() && !force {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                ));
            }
            repro_runner::fsutil::atomic_write_bytes(&path, DEFAULT_CONFIG_YAML.as_bytes())?;
            println!("wrote: {}", path.display());
            println!("next: repro describe");
        }
        Commands::Clean {
            config,
            root,
            logs,
            results,
            repos,
            venv,
        } => {
            let targets = CleanTargets {
                logs,
                results,
                repositories: repos,
                venv,
            };
            if !(logs || results || repos || venv) {
                println!("nothing to clean (pass --logs, --results, --repos or --venv)");
                return Ok(None);
            }
            let (cfg, _) = repro_runner::load_plan(config.as_deref(), &root, &[])?;
            for path in repro_runner::clean_workspace(&cfg, &root, targets)? {
                println!("removed: {}", path.display());
            }
        }
        Commands::Bundle { root, out } => {
            let out = out.unwrap_or_else(|| default_bundle_path(&root));
            let files = repro_runner::bundle(&root, &out)?;
            println!("bundle: {} ({} files)", out.display(), files);
        }
    }
    Ok(None)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Sync { json, .. } | Commands::Describe { json, .. } => {
            *json
        }
        _ => false,
    }
}

fn default_bundle_path(root: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    root.join(format!("repro-bundle-{}.zip", stamp))
}

fn sync_line(repo: &RepoSync) -> String {
    match &repo.outcome {
        Ok(outcome) => {
            let action = match outcome.action {
                SyncAction::Updated => match &outcome.previous {
                    Some(prev) => format!(
                        "updated {}..{}",
                        repro_runner::sync::short(prev),
                        repro_runner::sync::short(&outcome.commit)
                    ),
                    None => "updated".to_string(),
                },
                other => other.as_str().to_string(),
            };
            format!(
                "{:<10} {:<14} {} {}",
                repo.name,
                repo.branch,
                action,
                repro_runner::sync::short(&outcome.commit)
            )
        }
        Err(e) => format!("{:<10} {:<14} FAILED: {}", repo.name, repo.branch, e),
    }
}

fn print_report(report: &PipelineReport) {
    println!("config: {}", report.config_source);
    println!("root: {}", report.root.display());
    println!(
        "python: {} ({})",
        report.python.python.display(),
        report.python.outcome.as_str()
    );
    for repo in &report.repositories {
        println!("{}", sync_line(repo));
    }
    for inv in &report.invocations {
        println!(
            "{:<44} {:<9} {:>8.1}s  {}",
            inv.name,
            inv.status.as_str(),
            inv.duration.as_secs_f64(),
            inv.log_path.display()
        );
    }
    for line in report.summary_lines() {
        println!("{}", line);
    }
}

fn plan_to_json(plan: &PlanSummary) -> Value {
    json!({
        "config": plan.config_source,
        "root": plan.root.display().to_string(),
        "clean_results": plan.clean_results,
        "bootstrap": {
            "enabled": plan.bootstrap_enabled,
            "interpreter": plan.interpreter,
            "requirements": plan.requirements,
        },
        "repositories": plan.repositories.iter().map(|r| json!({
            "name": r.name,
            "url": r.url,
            "branch": r.branch,
            "dir": r.dir.display().to_string(),
            "present": r.present,
        })).collect::<Vec<_>>(),
        "invocations": plan.invocations.iter().map(|i| json!({
            "name": i.name,
            "kind": i.kind,
            "enabled": i.enabled,
            "requires": i.requires,
            "log": i.log.display().to_string(),
            "result_dir": i.result_dir.display().to_string(),
        })).collect::<Vec<_>>(),
    })
}

fn print_plan(plan: &PlanSummary) {
    println!("config: {}", plan.config_source);
    println!("root: {}", plan.root.display());
    println!("clean_results: {}", plan.clean_results);
    if plan.bootstrap_enabled {
        println!(
            "bootstrap: {} [{}]",
            plan.interpreter,
            plan.requirements.join(", ")
        );
    } else {
        println!("bootstrap: disabled");
    }
    println!("repositories:");
    for r in &plan.repositories {
        println!(
            "  {:<10} {} @ {}{}",
            r.name,
            r.url,
            r.branch,
            if r.present { "" } else { " (not cloned)" }
        );
    }
    let enabled = plan.invocations.iter().filter(|i| i.enabled).count();
    println!("invocations ({}/{} enabled):", enabled, plan.invocations.len());
    for i in &plan.invocations {
        let mark = if i.enabled { "*" } else { " " };
        let requires = if i.requires.is_empty() {
            String::new()
        } else {
            format!(" requires={}", i.requires.join(","))
        };
        println!("  {} {:<44} {}{}", mark, i.name, i.kind, requires);
    }
}
