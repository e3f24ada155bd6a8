//! The launch loop: provision, clear the backend lock, start, stagger.
//!
//! Runs are handled strictly one after another in sweep order. Only the
//! started processes run in parallel.

use crate::bindings::{ConfigBindingBuilder, Invocation};
use crate::error::{Result, SweepError};
use crate::fsutil::atomic_write_json_pretty;
use crate::launcher::{LaunchEnv, RunHandle, RunLauncher};
use crate::spec::SweepSpec;
use crate::sweep::{environment_descriptor, sanitize_segment, ParameterSweep, RunConfig};
use crate::workspace::{LaunchGate, OverwriteMode, RunWorkspace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CANCEL_POLL: Duration = Duration::from_millis(50);
pub const LAUNCH_RECORD_FILE: &str = "launch_record.json";
pub const RUN_MANIFEST_FILE: &str = "run.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Provisioned,
    /// Process started. Final only when it had already exited cleanly by
    /// the time it was checked.
    Launched,
    Running,
    FailedToStart,
    ProvisionFailed,
    /// Not attempted: the sweep was cancelled or aborted in strict mode.
    Skipped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Provisioned => "provisioned",
            RunState::Launched => "launched",
            RunState::Running => "running",
            RunState::FailedToStart => "failed_to_start",
            RunState::ProvisionFailed => "provision_failed",
            RunState::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunState::Running | RunState::Launched)
    }
}

#[derive(Clone, Debug)]
pub struct PlannedRun {
    pub config: RunConfig,
    pub invocation: Invocation,
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub config: RunConfig,
    pub state: RunState,
    pub handle: Option<RunHandle>,
    pub command_line: String,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SweepReport {
    pub experiment_label: String,
    pub environment_name: String,
    pub sweep_digest: String,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<RunOutcome>,
    pub cancelled: bool,
    pub aborted: bool,
    pub record_path: Option<PathBuf>,
}

impl SweepReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.state.is_success())
    }

    pub fn count(&self, state: RunState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn to_record(&self) -> LaunchRecord {
        LaunchRecord {
            schema_version: "launch_record_v1".to_string(),
            experiment_label: self.experiment_label.clone(),
            environment_name: self.environment_name.clone(),
            sweep_digest: self.sweep_digest.clone(),
            created_at: self.started_at,
            orchestrator_pid: std::process::id(),
            cancelled: self.cancelled,
            aborted: self.aborted,
            runs: self
                .outcomes
                .iter()
                .map(|o| RunRecord {
                    label: o.config.label.clone(),
                    run_index: o.config.run_index,
                    seed: o.config.seed,
                    device: o.config.device.as_ref().map(|d| d.env_value()),
                    state: o.state,
                    pid: o.handle.as_ref().map(|h| h.process_id),
                    log_path: o.config.log_path(),
                    output_dir: o.config.output_dir.clone(),
                    start_time: o.handle.as_ref().map(|h| h.start_time),
                    stagger_index: o.handle.as_ref().map(|h| h.stagger_index),
                    command_line: o.command_line.clone(),
                    error: o.error.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub schema_version: String,
    pub experiment_label: String,
    pub environment_name: String,
    pub sweep_digest: String,
    pub created_at: DateTime<Utc>,
    pub orchestrator_pid: u32,
    pub cancelled: bool,
    pub aborted: bool,
    pub runs: Vec<RunRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub label: String,
    pub run_index: usize,
    pub seed: u64,
    pub device: Option<String>,
    pub state: RunState,
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub output_dir: PathBuf,
    pub start_time: Option<DateTime<Utc>>,
    pub stagger_index: Option<usize>,
    pub command_line: String,
    pub error: Option<String>,
}

/// Where a sweep's launch record lives.
pub fn record_path(output_root: &Path, experiment_label: &str, environment_name: &str) -> PathBuf {
    output_root
        .join(sanitize_segment(experiment_label))
        .join(environment_descriptor(environment_name))
        .join(LAUNCH_RECORD_FILE)
}

pub struct Orchestrator {
    spec: SweepSpec,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(spec: SweepSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling stops further launches. Runs already started keep going.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spec(&self) -> &SweepSpec {
        &self.spec
    }

    /// Expands the sweep and renders every command without touching the
    /// filesystem.
    pub fn plan(&self) -> Result<Vec<PlannedRun>> {
        let runs = ParameterSweep::new(&self.spec)?.expand()?;
        let builder = ConfigBindingBuilder::new(&self.spec.launcher);
        Ok(runs
            .into_iter()
            .map(|config| {
                let invocation = builder.build(&config);
                PlannedRun { config, invocation }
            })
            .collect())
    }

    /// Launches the whole sweep. Only configuration problems are returned as
    /// errors, and they are raised before any run is touched; per-run
    /// failures end up in the report.
    pub fn run(&self) -> Result<SweepReport> {
        let plan = self.plan()?;
        let launcher = RunLauncher::new(
            LaunchEnv::from_settings(
                &self.spec.launcher.environment,
                std::env::var_os("LD_LIBRARY_PATH"),
            )?,
            self.spec.launcher.device_env.clone(),
        );
        let settings = &self.spec.launcher;
        let mode = OverwriteMode::from_flag(settings.overwrite_existing);
        let stagger = settings.stagger();
        let total = plan.len();

        let mut report = SweepReport {
            experiment_label: self.spec.experiment_label.clone(),
            environment_name: self.spec.environment_name.clone(),
            sweep_digest: self.spec.digest()?,
            started_at: Utc::now(),
            outcomes: Vec::with_capacity(total),
            cancelled: false,
            aborted: false,
            record_path: None,
        };
        info!(
            experiment = %self.spec.experiment_label,
            environment = %self.spec.environment_name,
            runs = total,
            overwrite = settings.overwrite_existing,
            stagger_secs = stagger.as_secs_f64(),
            "starting sweep"
        );
        if mode == OverwriteMode::Overwrite {
            warn!("overwrite mode is on: existing run directories will be deleted");
        }

        let mut launches = 0usize;
        for (position, planned) in plan.into_iter().enumerate() {
            let PlannedRun { config, invocation } = planned;
            let command_line = invocation.command_line();

            if self.cancel.is_cancelled() || report.aborted {
                report.cancelled |= self.cancel.is_cancelled();
                report.outcomes.push(RunOutcome {
                    config,
                    state: RunState::Skipped,
                    handle: None,
                    command_line,
                    error: None,
                });
                continue;
            }

            let (state, handle, err) = self.launch_one(&launcher, &config, &invocation, mode, launches);
            if state.is_success() {
                launches += 1;
            }
            if let Some(e) = &err {
                error!(label = %config.label, error = %e, "run failed");
                if settings.strict {
                    warn!("strict mode: aborting remaining launches");
                    report.aborted = true;
                }
            }
            if let Some(handle) = &handle {
                write_run_manifest(handle, &invocation);
            }
            report.outcomes.push(RunOutcome {
                config,
                state,
                handle: handle.clone(),
                command_line,
                error: err.map(|e| e.to_string()),
            });

            let more = position + 1 < total;
            if state.is_success() && more && !report.aborted {
                self.stagger(stagger);
            }
        }

        let path = record_path(
            &self.spec.base_output_root,
            &self.spec.experiment_label,
            &self.spec.environment_name,
        );
        match atomic_write_json_pretty(&path, &report.to_record()) {
            Ok(()) => report.record_path = Some(path),
            Err(e) => warn!(error = %e, "could not write launch record"),
        }
        info!(
            running = report.count(RunState::Running),
            failed = report.count(RunState::FailedToStart) + report.count(RunState::ProvisionFailed),
            skipped = report.count(RunState::Skipped),
            "sweep finished"
        );
        Ok(report)
    }

    fn launch_one(
        &self,
        launcher: &RunLauncher,
        config: &RunConfig,
        invocation: &Invocation,
        mode: OverwriteMode,
        stagger_index: usize,
    ) -> (RunState, Option<RunHandle>, Option<SweepError>) {
        let settings = &self.spec.launcher;
        let workspace = RunWorkspace::new(config);
        if let Err(e) = workspace.prepare(mode) {
            return (RunState::ProvisionFailed, None, Some(e));
        }
        transition(config, RunState::Pending, RunState::Provisioned);

        // Lock removal and spawn form one critical section per installation.
        let _gate = match &settings.lock_artifact {
            Some(lock) => {
                let gate = match LaunchGate::acquire(lock, &config.label, settings.gate_timeout()) {
                    Ok(gate) => gate,
                    Err(e) => return (RunState::ProvisionFailed, None, Some(e)),
                };
                if let Err(e) = workspace.clear_stale_lock(lock) {
                    return (RunState::ProvisionFailed, None, Some(e));
                }
                Some(gate)
            }
            None => None,
        };

        match launcher.launch(config, invocation, stagger_index) {
            Ok(launched) => {
                transition(config, RunState::Provisioned, RunState::Launched);
                match launched.early_exit {
                    None => (RunState::Running, Some(launched.handle), None),
                    Some(status) if status.success() => {
                        (RunState::Launched, Some(launched.handle), None)
                    }
                    Some(status) => {
                        let err = SweepError::Launch {
                            label: config.label.clone(),
                            program: invocation.program.clone(),
                            reason: format!("exited immediately ({})", status),
                        };
                        (RunState::FailedToStart, Some(launched.handle), Some(err))
                    }
                }
            }
            Err(e) => (RunState::FailedToStart, None, Some(e)),
        }
    }

    /// Sleeps between launches; cancellation cuts the wait short.
    fn stagger(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

fn transition(config: &RunConfig, from: RunState, to: RunState) {
    debug!(label = %config.label, from = from.as_str(), to = to.as_str(), "run state");
}

fn write_run_manifest(handle: &RunHandle, invocation: &Invocation) {
    let config = &handle.config;
    let manifest = json!({
        "schema_version": "run_manifest_v1",
        "label": config.label,
        "seed": config.seed,
        "device": config.device.as_ref().map(|d| d.env_value()),
        "axis_values": config.axis_values,
        "bindings": config.bindings,
        "program": invocation.program,
        "args": invocation.args,
        "working_dir": invocation.working_dir.as_ref().map(|d| d.display().to_string()),
        "pid": handle.process_id,
        "start_time": handle.start_time.to_rfc3339(),
        "stagger_index": handle.stagger_index,
        "log_path": handle.log_path.display().to_string(),
    });
    let path = config.output_dir.join(RUN_MANIFEST_FILE);
    if let Err(e) = atomic_write_json_pretty(&path, &manifest) {
        warn!(label = %config.label, error = %e, "could not write run manifest");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{load_record, check_runs, Liveness};
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sweep_orch_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    fn wait_for_file(path: &Path, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let contents = fs::read_to_string(path).unwrap_or_default();
            if contents.contains(needle) || Instant::now() > deadline {
                return contents;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// A sweep whose "training binary" is a shell one-liner that prints the
    /// device it was given and the flags it received.
    fn echo_sweep(root: &Path, seeds: &str) -> SweepSpec {
        let yaml = format!(
            r#"
experiment_label: exp1
environment_name: offline_ant_umaze
seeds: [{seeds}]
base_output_root: {root}
device_policy: offset-seed:5
launcher:
  program: sh
  args: ["-c", "echo device=$CUDA_VISIBLE_DEVICES args=$*; echo finished", "trainer"]
  stagger_seconds: 0
"#,
            seeds = seeds,
            root = root.display()
        );
        SweepSpec::from_yaml_str(&yaml).expect("parse")
    }

    #[test]
    fn configuration_errors_abort_before_anything_is_created() {
        let root = temp_root("config");
        let mut spec = echo_sweep(&root, "0");
        spec.hyperparameter_axes.insert(
            "mode".to_string(),
            vec![
                crate::spec::BindingValue::Str("a b".to_string()),
                crate::spec::BindingValue::Str("a_b".to_string()),
            ],
        );
        let err = Orchestrator::new(spec).expect("valid").run().expect_err("collision");
        assert!(matches!(err, SweepError::Configuration(_)));
        assert!(!root.join("exp1").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn launches_every_seed_with_its_own_device_and_log() {
        let root = temp_root("seeds");
        let lock = root.join("builder.lock");
        let mut spec = echo_sweep(&root, "0, 1, 2");
        spec.launcher.lock_artifact = Some(lock.clone());
        // Every child reports whether the lock was there when it started and
        // then leaves a fresh one behind, like a crashed build would.
        spec.launcher.args = vec![
            "-c".to_string(),
            format!(
                "if [ -e '{lock}' ]; then echo lock=present; else echo lock=absent; fi; \
                 touch '{lock}'; echo device=$CUDA_VISIBLE_DEVICES args=$*; echo finished",
                lock = lock.display()
            ),
            "trainer".to_string(),
        ];
        spec.launcher.stagger_seconds = 0.3;
        fs::write(&lock, b"").expect("stale lock");

        let report = Orchestrator::new(spec).unwrap().run().expect("run");
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.all_succeeded(), "{:?}", report.outcomes);
        assert!(!LaunchGate::gate_path(&lock).exists());

        for (i, outcome) in report.outcomes.iter().enumerate() {
            let handle = outcome.handle.as_ref().expect("handle");
            assert_eq!(handle.stagger_index, i);
            assert_eq!(
                handle.log_path,
                root.join("exp1/offline_ant_umaze").join(i.to_string()).join("stream.log")
            );
            let log = wait_for_file(&handle.log_path, "finished");
            assert!(log.contains("lock=absent"), "run {} saw a stale lock: {}", i, log);
            assert!(log.contains(&format!("device={}", 5 + i)), "{}", log);
            assert!(log.contains(&format!("--seed={}", i)), "{}", log);
            assert!(outcome.config.output_dir.join(RUN_MANIFEST_FILE).exists());
        }

        let record = load_record(report.record_path.as_ref().expect("record")).expect("load");
        assert_eq!(record.runs.len(), 3);
        assert_eq!(record.runs[1].device.as_deref(), Some("6"));
        assert!(record.runs.iter().all(|r| r.pid.is_some()));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn stagger_delay_separates_launches_but_not_after_the_last() {
        let root = temp_root("stagger");
        let mut spec = echo_sweep(&root, "0, 1, 2");
        spec.launcher.stagger_seconds = 0.2;
        let started = Instant::now();
        let report = Orchestrator::new(spec).unwrap().run().expect("run");
        let elapsed = started.elapsed();
        assert!(report.all_succeeded());
        assert!(elapsed >= Duration::from_millis(400), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2000), "{:?}", elapsed);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cancelled_sweep_launches_nothing() {
        let root = temp_root("cancel");
        let spec = echo_sweep(&root, "0, 1");
        let orchestrator = Orchestrator::new(spec).unwrap();
        orchestrator.cancel_token().cancel();
        let report = orchestrator.run().expect("run");
        assert!(report.cancelled);
        assert_eq!(report.count(RunState::Skipped), 2);
        assert!(!root.join("exp1/offline_ant_umaze/0").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn cancelling_during_stagger_skips_the_rest() {
        let root = temp_root("cancel_mid");
        let mut spec = echo_sweep(&root, "0, 1, 2");
        spec.launcher.stagger_seconds = 30.0;
        let orchestrator = Orchestrator::new(spec).unwrap();
        let token = orchestrator.cancel_token();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            token.cancel();
        });
        let started = Instant::now();
        let report = orchestrator.run().expect("run");
        canceller.join().expect("join");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(report.outcomes[0].state.is_success());
        assert_eq!(report.count(RunState::Skipped), 2);
        assert!(report.cancelled);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_launch_is_reported_and_sweep_continues() {
        let root = temp_root("continue");
        let mut spec = echo_sweep(&root, "0, 1");
        spec.launcher.program = "/nonexistent/trainer".to_string();
        let report = Orchestrator::new(spec).unwrap().run().expect("run");
        assert_eq!(report.count(RunState::FailedToStart), 2);
        assert!(!report.all_succeeded());
        assert!(report.outcomes.iter().all(|o| o.error.is_some()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn strict_mode_stops_at_first_failure() {
        let root = temp_root("strict");
        let mut spec = echo_sweep(&root, "0, 1, 2");
        spec.launcher.program = "/nonexistent/trainer".to_string();
        spec.launcher.strict = true;
        let report = Orchestrator::new(spec).unwrap().run().expect("run");
        assert!(report.aborted);
        assert_eq!(report.outcomes[0].state, RunState::FailedToStart);
        assert_eq!(report.count(RunState::Skipped), 2);
        assert!(!report.cancelled);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn provisioning_failure_is_per_run() {
        let root = temp_root("provision");
        let spec = echo_sweep(&root, "0, 1");
        // A file where seed 0's directory should go.
        fs::create_dir_all(root.join("exp1/offline_ant_umaze")).expect("env dir");
        fs::write(root.join("exp1/offline_ant_umaze/0"), b"blocker").expect("blocker");
        let report = Orchestrator::new(spec).unwrap().run().expect("run");
        assert_eq!(report.outcomes[0].state, RunState::ProvisionFailed);
        if cfg!(unix) {
            assert!(report.outcomes[1].state.is_success());
        }
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn status_reports_exited_runs_from_the_record() {
        let root = temp_root("status");
        let spec = echo_sweep(&root, "0");
        let report = Orchestrator::new(spec).unwrap().run().expect("run");
        let record = load_record(report.record_path.as_ref().unwrap()).expect("load");
        let log = &record.runs[0].log_path;
        wait_for_file(log, "finished");
        let pid = record.runs[0].pid.expect("pid");
        let deadline = Instant::now() + Duration::from_secs(10);
        while crate::status::process_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let statuses = check_runs(&record);
        assert_eq!(statuses[0].liveness, Liveness::Exited);
        assert!(statuses[0].log_bytes.unwrap_or(0) > 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn plan_renders_commands_without_touching_disk() {
        let root = temp_root("plan");
        let spec = echo_sweep(&root, "0, 1");
        let plan = Orchestrator::new(spec).unwrap().plan().expect("plan");
        assert_eq!(plan.len(), 2);
        assert!(plan[1].invocation.command_line().contains("--seed=1"));
        assert!(!root.join("exp1").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn record_path_uses_sanitized_segments() {
        assert_eq!(
            record_path(Path::new("/r"), "exp 1", "ant/umaze"),
            PathBuf::from("/r/exp_1/ant_umaze/launch_record.json")
        );
    }
}
