use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use exdir_core::{
    AllocationRequest, Error, Experiments, Interrupted, Params, RecordEntry, RunDirectory,
    RunError, RunOutcome,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const ENV_RUN_DIR: &str = "EXDIR_RUN_DIR";
const ENV_RUN_ID: &str = "EXDIR_RUN_ID";
const ENV_ROOT: &str = "EXDIR_ROOT";

#[derive(Parser)]
#[command(name = "exdir", version = "0.3.0", about = "Experiment directory manager")]
struct Cli {
    /// Experiment root; defaults to the current directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the root layout.
    Init {
        #[arg(long)]
        json: bool,
    },
    /// Validate an existing root without touching it.
    Check {
        #[arg(long)]
        json: bool,
    },
    NextId {
        #[arg(long)]
        json: bool,
    },
    /// Allocate a run directory and execute a command inside it.
    Run {
        #[arg(long)]
        tmp: bool,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        /// Parameter kept out of the stored record.
        #[arg(long = "volatile")]
        volatile: Vec<String>,
        /// Reuse the parameters of an earlier record.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        automark: Vec<String>,
        #[arg(long)]
        zfill: Option<usize>,
        #[arg(long)]
        interactive: bool,
        #[arg(long)]
        json: bool,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    Mark {
        tag: String,
        ids: Vec<u64>,
        #[arg(long)]
        json: bool,
    },
    Delete {
        ids: Vec<u64>,
        /// Also remove marks and the run directories.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    Info {
        /// Mark path to read instead of the index, e.g. `best` or `lr/0.1`.
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = resolve_root(cli.root).and_then(|root| run_command(&root, cli.command));
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    Ok(match root {
        Some(path) if path.is_absolute() => path,
        Some(path) => cwd.join(path),
        None => cwd,
    })
}

fn run_command(root: &Path, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { json } => {
            let ex = Experiments::init(root)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "init",
                    "root": ex.root().display().to_string(),
                    "options": ex.options(),
                })));
            }
            println!("root: {}", ex.root().display());
        }
        Commands::Check { json } => {
            let ex = Experiments::open_existing(root)?;
            let runs = ex.run_count()?;
            let next_id = ex.next_id()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check",
                    "root": ex.root().display().to_string(),
                    "runs": runs,
                    "next_id": next_id,
                })));
            }
            println!("ok");
            println!("runs: {}", runs);
            println!("next_id: {}", next_id);
        }
        Commands::NextId { json } => {
            let next_id = Experiments::open_existing(root)?.next_id()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "next-id",
                    "next_id": next_id,
                })));
            }
            println!("{}", next_id);
        }
        Commands::Run {
            tmp,
            tag,
            set_values,
            volatile,
            config,
            automark,
            zfill,
            interactive,
            json,
            command,
        } => {
            let mut ex = Experiments::init(root)?;
            ex.configure(|options| {
                if let Some(zfill) = zfill {
                    options.zfill = zfill;
                }
                if !automark.is_empty() {
                    options.automark = automark;
                }
                if interactive {
                    options.quarantine.interactive = true;
                }
            })?;
            let params = build_params(config.as_deref(), &set_values, &volatile)?;
            let interrupted = interrupt_flag()?;
            let started = ex.start(&params, &AllocationRequest { tmp, tag })?;
            let outcome = ex
                .guard(&started)?
                .execute(|run| run_child(&command, run, ex.root(), &interrupted))?;
            let status = match outcome {
                RunOutcome::Completed(()) => "completed",
                RunOutcome::Suppressed { failure, .. } => {
                    tracing::warn!(run = %started.run.name, "{}", failure.message);
                    "interrupted"
                }
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "status": status,
                    "run": run_to_json(&started.run),
                })));
            }
            println!("run_id: {}", started.run.id());
            println!("run_dir: {}", started.run.path.display());
        }
        Commands::Mark { tag, ids, json } => {
            let report = Experiments::open_existing(root)?.mark(&tag, &ids)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "mark",
                    "tag": tag,
                    "created": paths_to_json(&report.created),
                    "missing": report.missing,
                })));
            }
            for link in &report.created {
                println!("marked: {}", link.display());
            }
        }
        Commands::Delete { ids, all, json } => {
            let report = Experiments::open_existing(root)?.delete(&ids, all)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "delete",
                    "unindexed": report.unindexed,
                    "removed": paths_to_json(&report.removed),
                    "unmarked": paths_to_json(&report.unmarked),
                    "missing": report.missing,
                })));
            }
            for name in &report.unindexed {
                println!("unindexed: {}", name);
            }
            for path in report.unmarked.iter().chain(&report.removed) {
                println!("removed: {}", path.display());
            }
        }
        Commands::Info { source, json } => {
            let entries = Experiments::open_existing(root)?.records(source.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "info",
                    "source": source,
                    "records": entries.iter().map(record_to_json).collect::<Vec<_>>(),
                })));
            }
            for entry in &entries {
                print_record(entry);
            }
        }
    }
    Ok(None)
}

fn build_params(config: Option<&Path>, set_values: &[String], volatile: &[String]) -> Result<Params> {
    let mut params = match config {
        Some(path) => Params::from_record(path)?,
        None => Params::new(),
    };
    for raw in set_values {
        params.apply_assignment(raw)?;
    }
    for key in volatile {
        params.mark_volatile(key.as_str());
    }
    Ok(params)
}

/// SIGINT no longer kills exdir itself; the child still receives it and the
/// guard gets to settle the run.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))
        .context("cannot install SIGINT handler")?;
    Ok(flag)
}

fn run_child(
    command: &[String],
    run: &RunDirectory,
    root: &Path,
    interrupted: &AtomicBool,
) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("no command given"))?;
    if interrupted.load(Ordering::SeqCst) {
        return Err(anyhow::Error::new(Interrupted).context("interrupted before start"));
    }
    let status = Command::new(program)
        .args(args)
        .env(ENV_RUN_DIR, &run.path)
        .env(ENV_RUN_ID, run.id().to_string())
        .env(ENV_ROOT, root)
        .status()
        .with_context(|| format!("failed to start {}", program))?;
    if status.success() {
        return Ok(());
    }
    if interrupted.load(Ordering::SeqCst) || killed_by_sigint(&status) {
        return Err(anyhow::Error::new(Interrupted)
            .context(format!("command {:?} stopped ({})", command, status)));
    }
    Err(anyhow!("command {:?} failed ({})", command, status))
}

#[cfg(unix)]
fn killed_by_sigint(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(signal_hook::consts::SIGINT)
}

#[cfg(not(unix))]
fn killed_by_sigint(_status: &ExitStatus) -> bool {
    false
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(err) = err.downcast_ref::<Error>() {
        return match err {
            Error::InvalidRoot { .. } => "invalid_root",
            Error::MarkInput(_) => "mark_input",
            Error::ReservedParam(_) => "reserved_param",
            Error::Validation(_) => "validation_failed",
            Error::Record { .. } => "bad_record",
            Error::Config { .. } => "bad_config",
            Error::Io { .. } => "io_error",
        };
    }
    if err.downcast_ref::<RunError>().is_some() {
        return "run_failed";
    }
    "command_failed"
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Init { json }
        | Commands::Check { json }
        | Commands::NextId { json }
        | Commands::Run { json, .. }
        | Commands::Mark { json, .. }
        | Commands::Delete { json, .. }
        | Commands::Info { json, .. } => *json,
    }
}

fn run_to_json(run: &RunDirectory) -> Value {
    json!({
        "run_id": run.id(),
        "name": run.name.as_str(),
        "location": run.location.dir_name(),
        "run_dir": run.path.display().to_string(),
    })
}

fn paths_to_json(paths: &[PathBuf]) -> Value {
    json!(paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>())
}

fn record_to_json(entry: &RecordEntry) -> Value {
    json!({
        "record": entry.record.values(),
        "run_dir": entry.run_dir.display().to_string(),
        "source": entry.source.display().to_string(),
    })
}

fn print_record(entry: &RecordEntry) {
    let params = entry
        .record
        .params()
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "{:>6}  {}  {}",
        entry.record.id().unwrap_or_default(),
        entry.run_dir.display(),
        params
    );
}
