//! Per-run directories and the backend's shared lock artifact.

use crate::error::{Result, SweepError};
use crate::status::process_alive;
use crate::sweep::RunConfig;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const GATE_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteMode {
    /// `mkdir -p`: existing artifacts stay.
    #[default]
    Keep,
    /// `rm -r` then `mkdir -p`: previous artifacts are discarded.
    Overwrite,
}

impl OverwriteMode {
    pub fn from_flag(overwrite: bool) -> Self {
        if overwrite {
            OverwriteMode::Overwrite
        } else {
            OverwriteMode::Keep
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareOutcome {
    pub created: bool,
    /// Entries removed from a previous run in overwrite mode.
    pub discarded_entries: usize,
}

pub struct RunWorkspace<'a> {
    run: &'a RunConfig,
}

impl<'a> RunWorkspace<'a> {
    pub fn new(run: &'a RunConfig) -> Self {
        Self { run }
    }

    pub fn output_dir(&self) -> &Path {
        &self.run.output_dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.run.log_path()
    }

    fn provisioning(&self, path: &Path, source: std::io::Error) -> SweepError {
        SweepError::Provisioning {
            label: self.run.label.clone(),
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn prepare(&self, mode: OverwriteMode) -> Result<PrepareOutcome> {
        let dir = self.output_dir();
        let existed = dir.exists();
        let mut discarded_entries = 0;
        if existed && mode == OverwriteMode::Overwrite {
            discarded_entries = WalkDir::new(dir)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .count();
            warn!(
                label = %self.run.label,
                path = %dir.display(),
                discarded_entries,
                "overwrite mode: discarding previous run directory"
            );
            fs::remove_dir_all(dir).map_err(|e| self.provisioning(dir, e))?;
        }
        fs::create_dir_all(dir).map_err(|e| self.provisioning(dir, e))?;
        debug!(label = %self.run.label, path = %dir.display(), "run directory ready");
        Ok(PrepareOutcome {
            created: !existed || mode == OverwriteMode::Overwrite,
            discarded_entries,
        })
    }

    /// Removes the backend's build-lock marker. A missing marker is success.
    /// Callers hold a [`LaunchGate`] around this and the following spawn.
    pub fn clear_stale_lock(&self, lock_artifact: &Path) -> Result<bool> {
        match fs::remove_file(lock_artifact) {
            Ok(()) => {
                info!(
                    label = %self.run.label,
                    lock = %lock_artifact.display(),
                    "removed stale backend lock artifact"
                );
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.provisioning(lock_artifact, e)),
        }
    }
}

/// Exclusive marker serializing lock-artifact removal and child start across
/// orchestrators that share one backend installation.
///
/// Best effort only: it relies on `create_new` on the lock's directory and
/// on every orchestrator using it. When that directory does not exist the
/// gate is a no-op and a single orchestrator per installation is assumed.
/// A gate whose holder died is renamed aside before deletion, so two waiters
/// reclaiming it at once cannot delete each other's fresh gate.
#[derive(Debug)]
pub struct LaunchGate {
    path: Option<PathBuf>,
}

impl Drop for LaunchGate {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = fs::remove_file(path);
        }
    }
}

#[derive(Deserialize)]
struct GatePayload {
    pid: u32,
}

impl LaunchGate {
    pub fn gate_path(lock_artifact: &Path) -> PathBuf {
        let mut name = lock_artifact
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".launch-gate");
        lock_artifact.with_file_name(name)
    }

    pub fn is_held(&self) -> bool {
        self.path.is_some()
    }

    pub fn acquire(lock_artifact: &Path, label: &str, timeout: Duration) -> Result<LaunchGate> {
        let gate_path = Self::gate_path(lock_artifact);
        match gate_path.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => {}
            _ => {
                debug!(
                    lock = %lock_artifact.display(),
                    "lock artifact directory missing; launch gate disabled"
                );
                return Ok(LaunchGate { path: None });
            }
        }
        let started = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&gate_path)
            {
                Ok(mut file) => {
                    let payload = json!({
                        "pid": std::process::id(),
                        "label": label,
                        "acquired_at": Utc::now().to_rfc3339(),
                    });
                    let _ = writeln!(file, "{}", payload);
                    let _ = file.sync_all();
                    return Ok(LaunchGate {
                        path: Some(gate_path),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(holder) = read_gate_holder(&gate_path) {
                        if holder != std::process::id() && !process_alive(holder) {
                            warn!(
                                gate = %gate_path.display(),
                                holder,
                                "reclaiming launch gate left by a dead orchestrator"
                            );
                            reclaim_stale_gate(&gate_path, holder);
                            continue;
                        }
                    }
                    if started.elapsed() >= timeout {
                        return Err(SweepError::Provisioning {
                            label: label.to_string(),
                            path: gate_path.clone(),
                            source: std::io::Error::new(
                                ErrorKind::TimedOut,
                                format!(
                                    "launch gate still held after {}s",
                                    timeout.as_secs()
                                ),
                            ),
                        });
                    }
                    thread::sleep(GATE_POLL);
                }
                Err(e) => {
                    return Err(SweepError::Provisioning {
                        label: label.to_string(),
                        path: gate_path,
                        source: e,
                    })
                }
            }
        }
    }
}

/// Moves a dead holder's gate out of the way. The file is renamed to a
/// private name first and only deleted if it still names `dead_holder`;
/// a waiter that lost the race and moved a freshly acquired gate puts it
/// back instead. Returns whether the stale gate was removed.
fn reclaim_stale_gate(gate_path: &Path, dead_holder: u32) -> bool {
    let mut name = gate_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".stale.{}.{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let aside = gate_path.with_file_name(name);
    if fs::rename(gate_path, &aside).is_err() {
        // Someone else already reclaimed it.
        return false;
    }
    if read_gate_holder(&aside) == Some(dead_holder) {
        let _ = fs::remove_file(&aside);
        return true;
    }
    // hard_link fails if a new gate appeared meanwhile; that holder wins.
    let _ = fs::hard_link(&aside, gate_path);
    let _ = fs::remove_file(&aside);
    false
}

fn read_gate_holder(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str::<GatePayload>(raw.trim())
        .ok()
        .map(|p| p.pid)
}
