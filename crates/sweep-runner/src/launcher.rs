//! Detached child processes.
//!
//! Every child gets an explicit environment map; the orchestrator's own
//! environment is never mutated, so nothing set for one run can leak into
//! the next.

use crate::bindings::Invocation;
use crate::device::DeviceSet;
use crate::error::{Result, SweepError};
use crate::fsutil::io_err;
use crate::spec::EnvironmentSettings;
use crate::sweep::RunConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use tracing::{debug, info};

/// Variables the training stack expects regardless of the experiment.
pub const DEFAULT_CHILD_ENV: &[(&str, &str)] = &[
    ("HDF5_USE_FILE_LOCKING", "FALSE"),
    ("D4RL_SUPPRESS_IMPORT_ERROR", "1"),
    ("XLA_PYTHON_CLIENT_PREALLOCATE", "false"),
    ("TF_FORCE_GPU_ALLOW_GROWTH", "true"),
    ("XLA_FLAGS", "--xla_gpu_force_compilation_parallelism=1"),
];

/// Immutable environment shared by every launch of a sweep. Per-run values
/// (the device variable) are layered on a copy in [`LaunchEnv::for_run`].
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchEnv {
    vars: BTreeMap<String, String>,
}

impl LaunchEnv {
    /// `inherited_library_path` is the orchestrator's `LD_LIBRARY_PATH`, read
    /// once by the caller.
    pub fn from_settings(
        settings: &EnvironmentSettings,
        inherited_library_path: Option<OsString>,
    ) -> Result<Self> {
        let mut vars: BTreeMap<String, String> = DEFAULT_CHILD_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        if !settings.library_paths.is_empty() {
            let mut paths: Vec<PathBuf> = inherited_library_path
                .as_deref()
                .map(|p| std::env::split_paths(p).collect())
                .unwrap_or_default();
            paths.extend(settings.library_paths.iter().cloned());
            let joined = std::env::join_paths(paths).map_err(|e| {
                SweepError::config(format!("invalid launcher.environment.library_paths: {e}"))
            })?;
            vars.insert(
                "LD_LIBRARY_PATH".to_string(),
                joined.to_string_lossy().to_string(),
            );
        }
        if let Some(root) = &settings.project_root {
            vars.insert("PYTHONPATH".to_string(), root.display().to_string());
        }
        for (k, v) in &settings.vars {
            vars.insert(k.clone(), v.clone());
        }
        Ok(Self { vars })
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn for_run(&self, device_env: &str, device: Option<&DeviceSet>) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        if let Some(device) = device {
            vars.insert(device_env.to_string(), device.env_value());
        }
        vars
    }
}

/// A started run. The process is not owned: it keeps running when the
/// handle is dropped and when the orchestrator exits.
#[derive(Clone, Debug, Serialize)]
pub struct RunHandle {
    pub config: RunConfig,
    pub process_id: u32,
    pub log_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub stagger_index: usize,
    pub command_line: String,
}

#[derive(Debug)]
pub struct LaunchedRun {
    pub handle: RunHandle,
    /// Set when the child had already exited by the time `launch` returned.
    pub early_exit: Option<ExitStatus>,
}

pub struct RunLauncher {
    env: LaunchEnv,
    device_env: String,
}

impl RunLauncher {
    pub fn new(env: LaunchEnv, device_env: impl Into<String>) -> Self {
        Self {
            env,
            device_env: device_env.into(),
        }
    }

    pub fn env(&self) -> &LaunchEnv {
        &self.env
    }

    pub fn launch(
        &self,
        run: &RunConfig,
        invocation: &Invocation,
        stagger_index: usize,
    ) -> Result<LaunchedRun> {
        let log_path = run.log_path();
        let stdout = open_append(&log_path)?;
        let stderr = stdout.try_clone().map_err(io_err(&log_path))?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(self.env.for_run(&self.device_env, run.device.as_ref()))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        detach(&mut cmd);

        let command_line = invocation.command_line();
        debug!(label = %run.label, command = %command_line, "spawning run");
        let mut child = cmd.spawn().map_err(|e| SweepError::Launch {
            label: run.label.clone(),
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;
        let process_id = child.id();
        let start_time = Utc::now();

        let early_exit = child.try_wait().ok().flatten();
        if early_exit.is_none() {
            reap_in_background(child, run.label.clone());
        }

        info!(
            label = %run.label,
            pid = process_id,
            device = %run.device.as_ref().map(|d| d.env_value()).unwrap_or_else(|| "-".to_string()),
            log = %log_path.display(),
            "run launched"
        );
        Ok(LaunchedRun {
            handle: RunHandle {
                config: run.clone(),
                process_id,
                log_path,
                start_time,
                stagger_index,
                command_line,
            },
            early_exit,
        })
    }
}

fn open_append(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))
}

/// Puts the child in its own process group so a Ctrl-C aimed at the
/// orchestrator's terminal does not reach the runs.
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}

/// Collects the exit status while the orchestrator is still alive, so
/// finished runs do not linger as zombies. Once the orchestrator exits the
/// children are re-parented and this thread simply goes away.
fn reap_in_background(mut child: std::process::Child, label: String) {
    let spawned = thread::Builder::new()
        .name(format!("reap-{}", child.id()))
        .spawn(move || match child.wait() {
            Ok(status) => debug!(label = %label, status = %status, "run exited"),
            Err(e) => debug!(label = %label, error = %e, "lost track of run"),
        });
    if let Err(e) = spawned {
        debug!(error = %e, "could not start reaper thread");
    }
}
