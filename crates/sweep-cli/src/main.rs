use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use sweep_runner::{
    orchestrator, spec, status, DevicePolicy, Orchestrator, SweepOverrides, SweepReport,
    SweepSpec,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Launch seed/hyperparameter sweeps of training runs")]
struct Cli {
    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug, Default)]
struct SweepArgs {
    /// Declarative sweep file (YAML). Flags below override its values.
    #[arg(value_name = "SWEEP_FILE")]
    sweep_file: Option<PathBuf>,
    /// Same as the positional SWEEP_FILE.
    #[arg(long = "sweep-file", value_name = "PATH", conflicts_with = "sweep_file")]
    sweep_file_flag: Option<PathBuf>,
    #[arg(long)]
    experiment_label: Option<String>,
    #[arg(long)]
    env_name: Option<String>,
    /// Comma-separated seeds, ranges allowed: `0,1,2` or `0-4`.
    #[arg(long)]
    seeds: Option<String>,
    /// Hyperparameter axis, repeatable: `name=v1,v2`.
    #[arg(long = "axis")]
    axes: Vec<String>,
    /// Sweep-level binding, repeatable: `key=value`.
    #[arg(long = "set")]
    set_values: Vec<String>,
    /// none | fixed:0,1 | round-robin:0,1 | offset-seed:<base> | offset-index:<base>
    #[arg(long)]
    device_policy: Option<String>,
    /// Devices 0..N are valid.
    #[arg(long)]
    device_count: Option<u32>,
    #[arg(long)]
    stagger_seconds: Option<f64>,
    /// Delete an existing run directory before re-creating it.
    #[arg(long)]
    overwrite_existing: bool,
    /// Stop launching after the first failed run.
    #[arg(long)]
    strict: bool,
    #[arg(long)]
    output_root: Option<PathBuf>,
}

impl SweepArgs {
    fn sweep_file(&self) -> Option<&Path> {
        self.sweep_file
            .as_deref()
            .or(self.sweep_file_flag.as_deref())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Provision and launch every run of the sweep.
    Launch {
        #[command(flatten)]
        sweep: SweepArgs,
        /// Print the plan instead of launching.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the expanded runs and their commands.
    Plan {
        #[command(flatten)]
        sweep: SweepArgs,
        #[arg(long)]
        json: bool,
    },
    /// Report which launched runs are still alive.
    Status {
        /// Launch record to read. Defaults to the one under the output root.
        #[arg(long)]
        record: Option<PathBuf>,
        #[arg(long)]
        output_root: Option<PathBuf>,
        #[arg(long)]
        experiment_label: Option<String>,
        #[arg(long)]
        env_name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Write a commented sweep file template.
    Init {
        #[arg(long, default_value = "sweep.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok((payload, ok)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<sweep_runner::SweepError>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose == 0 && !quiet {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    } else {
        EnvFilter::new(default_level)
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Returns the JSON payload (in `--json` mode) and whether the command
/// fully succeeded.
fn run_command(command: Commands) -> Result<(Option<Value>, bool)> {
    match command {
        Commands::Launch {
            sweep,
            dry_run,
            json,
        } => {
            let spec = resolve(&sweep)?;
            let orchestrator = Orchestrator::new(spec)?;
            if dry_run {
                return plan_output(&orchestrator, json, "launch");
            }
            let report = orchestrator.run()?;
            let ok = report.all_succeeded();
            if json {
                return Ok((Some(report_to_json(&report, ok)), ok));
            }
            print_report(&report);
            Ok((None, ok))
        }
        Commands::Plan { sweep, json } => {
            let spec = resolve(&sweep)?;
            let orchestrator = Orchestrator::new(spec)?;
            plan_output(&orchestrator, json, "plan")
        }
        Commands::Status {
            record,
            output_root,
            experiment_label,
            env_name,
            json,
        } => {
            let path = match record {
                Some(path) => path,
                None => {
                    let label = experiment_label
                        .ok_or_else(|| anyhow!("status needs --record or --experiment-label"))?;
                    let env = env_name
                        .ok_or_else(|| anyhow!("status needs --record or --env-name"))?;
                    let root = spec::expand_home(&output_root.unwrap_or_else(|| PathBuf::from("runs")));
                    orchestrator::record_path(&root, &label, &env)
                }
            };
            let record = status::load_record(&path)
                .with_context(|| format!("reading launch record {}", path.display()))?;
            let statuses = status::check_runs(&record);
            if json {
                return Ok((
                    Some(json!({
                        "ok": true,
                        "command": "status",
                        "record": path.display().to_string(),
                        "experiment": record.experiment_label,
                        "environment": record.environment_name,
                        "sweep_digest": record.sweep_digest,
                        "runs": statuses,
                    })),
                    true,
                ));
            }
            println!("record: {}", path.display());
            println!("experiment: {}", record.experiment_label);
            println!("environment: {}", record.environment_name);
            println!("created_at: {}", record.created_at.to_rfc3339());
            for s in &statuses {
                println!(
                    "{:<16} {:<12} pid={:<8} log_bytes={:<10} {}",
                    s.state_at_launch.as_str(),
                    s.liveness.as_str(),
                    s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    s.log_bytes.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string()),
                    s.label
                );
            }
            Ok((None, true))
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "sweep file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, sweep_runner::SWEEP_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!(
                "next: fill in the REQUIRED fields, then: sweep plan {}",
                path.display()
            );
            Ok((None, true))
        }
    }
}

fn resolve(args: &SweepArgs) -> Result<SweepSpec> {
    let overrides = build_overrides(args)?;
    let spec = sweep_runner::resolve_sweep(args.sweep_file(), &overrides)?;
    debug!(
        experiment = %spec.experiment_label,
        environment = %spec.environment_name,
        device_policy = %spec.device_policy.as_string(),
        "resolved sweep"
    );
    Ok(spec)
}

fn build_overrides(args: &SweepArgs) -> Result<SweepOverrides> {
    let seeds = args
        .seeds
        .as_deref()
        .map(spec::parse_seeds_arg)
        .transpose()?;
    let axes = args
        .axes
        .iter()
        .map(|raw| spec::parse_axis_arg(raw))
        .collect::<sweep_runner::Result<Vec<_>>>()?;
    let set_bindings = args
        .set_values
        .iter()
        .map(|raw| spec::parse_set_arg(raw))
        .collect::<sweep_runner::Result<Vec<_>>>()?;
    let device_policy = args
        .device_policy
        .as_deref()
        .map(str::parse::<DevicePolicy>)
        .transpose()?;
    Ok(SweepOverrides {
        experiment_label: args.experiment_label.clone(),
        environment_name: args.env_name.clone(),
        seeds,
        axes,
        set_bindings,
        base_output_root: args.output_root.clone(),
        device_policy,
        device_count: args.device_count,
        stagger_seconds: args.stagger_seconds,
        overwrite_existing: args.overwrite_existing,
        strict: args.strict,
    })
}

fn plan_output(orchestrator: &Orchestrator, json: bool, command: &str) -> Result<(Option<Value>, bool)> {
    let plan = orchestrator.plan()?;
    let spec = orchestrator.spec();
    if json {
        let runs: Vec<Value> = plan
            .iter()
            .map(|p| {
                json!({
                    "run_index": p.config.run_index,
                    "label": p.config.label,
                    "seed": p.config.seed,
                    "device": p.config.device.as_ref().map(|d| d.env_value()),
                    "output_dir": p.config.output_dir.display().to_string(),
                    "log_path": p.config.log_path().display().to_string(),
                    "command": p.invocation.command_line(),
                })
            })
            .collect();
        return Ok((
            Some(json!({
                "ok": true,
                "command": command,
                "dry_run": true,
                "experiment": spec.experiment_label,
                "environment": spec.environment_name,
                "total_runs": plan.len(),
                "overwrite_existing": spec.launcher.overwrite_existing,
                "runs": runs,
            })),
            true,
        ));
    }
    println!("experiment: {}", spec.experiment_label);
    println!("environment: {}", spec.environment_name);
    println!("total_runs: {}", plan.len());
    println!("device_policy: {}", spec.device_policy.as_string());
    println!("stagger_seconds: {}", spec.launcher.stagger_seconds);
    if spec.launcher.overwrite_existing {
        println!("overwrite_existing: true (existing run directories will be deleted)");
    }
    for p in &plan {
        println!(
            "[{}] {} device={}",
            p.config.run_index,
            p.config.label,
            p.config
                .device
                .as_ref()
                .map(|d| d.env_value())
                .unwrap_or_else(|| "-".to_string())
        );
        println!("    {}", p.invocation.command_line());
    }
    Ok((None, true))
}

fn report_to_json(report: &SweepReport, ok: bool) -> Value {
    json!({
        "ok": ok,
        "command": "launch",
        "experiment": report.experiment_label,
        "environment": report.environment_name,
        "sweep_digest": report.sweep_digest,
        "cancelled": report.cancelled,
        "aborted": report.aborted,
        "record": report.record_path.as_ref().map(|p| p.display().to_string()),
        "runs": report.to_record().runs,
    })
}

fn print_report(report: &SweepReport) {
    println!("experiment: {}", report.experiment_label);
    println!("environment: {}", report.environment_name);
    println!("sweep_digest: {}", report.sweep_digest);
    for outcome in &report.outcomes {
        println!(
            "{:<16} pid={:<8} log={}  {}",
            outcome.state.as_str(),
            outcome
                .handle
                .as_ref()
                .map(|h| h.process_id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            outcome.config.log_path().display(),
            outcome.config.label
        );
        if let Some(err) = &outcome.error {
            println!("    error: {}", err);
        }
    }
    if report.aborted {
        println!("aborted: strict mode stopped the sweep after a failure");
    }
    if report.cancelled {
        println!("cancelled: remaining runs were not launched");
    }
    if let Some(path) = &report.record_path {
        println!("record: {}", display_relative(path));
    }
}

fn display_relative(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(&cwd).ok().map(|p| p.display().to_string()))
        .unwrap_or_else(|| path.display().to_string())
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

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Launch { json, .. } | Commands::Plan { json, .. } | Commands::Status { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}
