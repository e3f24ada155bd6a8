//! Reading a launch record back and checking which runs are still alive.
//!
//! Liveness is a signal-0 check on the pid. Pids can be recycled by the OS, so a run that
//! exited long ago may show up as alive; this is a hint for the operator,
//! not a supervisor.

use crate::error::Result;
use crate::fsutil::io_err;
use crate::orchestrator::{LaunchRecord, RunState};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Exited,
    /// The run never got a process.
    NotLaunched,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Alive => "alive",
            Liveness::Exited => "exited",
            Liveness::NotLaunched => "not_launched",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunStatus {
    pub label: String,
    pub state_at_launch: RunState,
    pub pid: Option<u32>,
    pub liveness: Liveness,
    pub log_path: PathBuf,
    pub log_bytes: Option<u64>,
}

pub fn load_record(path: &Path) -> Result<LaunchRecord> {
    let raw = fs::read(path).map_err(io_err(path))?;
    Ok(serde_json::from_slice(&raw)?)
}

pub fn check_runs(record: &LaunchRecord) -> Vec<RunStatus> {
    record
        .runs
        .iter()
        .map(|run| {
            let liveness = match run.pid {
                Some(pid) if process_alive(pid) => Liveness::Alive,
                Some(_) => Liveness::Exited,
                None => Liveness::NotLaunched,
            };
            RunStatus {
                label: run.label.clone(),
                state_at_launch: run.state,
                pid: run.pid,
                liveness,
                log_path: run.log_path.clone(),
                log_bytes: fs::metadata(&run.log_path).ok().map(|m| m.len()),
            }
        })
        .collect()
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 only checks that the pid exists and may be signalled.
    let rc = unsafe { libc::kill(raw, 0) };
    let exists = rc == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state follows the parenthesised command name, which may itself
    // contain spaces or parentheses.
    stat.rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}
