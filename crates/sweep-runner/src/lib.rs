//! Expands seed × hyperparameter sweeps into isolated training runs and
//! launches each one as a detached process with its own device, directory,
//! log stream and override set.

pub mod bindings;
pub mod device;
pub mod error;
pub mod fsutil;
pub mod launcher;
pub mod orchestrator;
pub mod spec;
pub mod status;
pub mod sweep;
pub mod workspace;

pub use bindings::{shell_join, shell_quote, ConfigBindingBuilder, Invocation};
pub use device::{DevicePolicy, DeviceSet};
pub use error::{Result, SweepError};
pub use launcher::{LaunchEnv, RunHandle, RunLauncher};
pub use orchestrator::{
    record_path, LaunchRecord, Orchestrator, PlannedRun, RunOutcome, RunRecord, RunState,
    SweepReport,
};
pub use spec::{BindingValue, LauncherSettings, SweepOverrides, SweepSpec};
pub use status::{Liveness, RunStatus};
pub use sweep::{ParameterSweep, RunConfig};
pub use workspace::{LaunchGate, OverwriteMode, RunWorkspace};
pub use tokio_util::sync::CancellationToken;

/// Loads a sweep file (when given), layers command-line values on top,
/// expands `~/` and validates.
pub fn resolve_sweep(
    sweep_file: Option<&std::path::Path>,
    overrides: &SweepOverrides,
) -> Result<SweepSpec> {
    let mut spec = match sweep_file {
        Some(path) => SweepSpec::load(path)?,
        None => SweepSpec::from_overrides(overrides)?,
    };
    spec.apply_overrides(overrides);
    spec.expand_paths();
    spec.validate()?;
    Ok(spec)
}

/// Commented starting point written by `sweep init`.
pub const SWEEP_TEMPLATE: &str = "\
experiment_label: ''                  # REQUIRED: groups all runs under <output_root>/<label>
environment_name: ''                  # REQUIRED: e.g. offline_ant_umaze
seeds: [0, 1, 2]
hyperparameter_axes: {}               # e.g. {agent_config.bc_coef: [0.05, 0.1]}
base_output_root: ~/contrastive_rl_logs
extra_bindings: {}                    # key: value overrides shared by every run
# dataset_dir: ~/datasets/{env}       # {env} and {seed} are substituted
device_policy: offset-seed:0          # none | fixed:0,1 | round-robin:0,1 | offset-seed:<base> | offset-index:<base>
# device_count: 8
launcher:
  program: python
  args: [lp_contrastive.py, --lp_launch_type=local_mp]
  iteration_budget: 1000000
  # lock_artifact: ~/miniconda3/envs/crl/lib/python3.9/site-packages/mujoco_py/generated/mujoco_py-2.1.2.14_39_linuxgpuextensionbuilder_lock
  stagger_seconds: 5
  overwrite_existing: false
  strict: false
  environment:
    # project_root: ~/contrastive_rl
    library_paths: []                 # appended to LD_LIBRARY_PATH, e.g. ~/.mujoco/mujoco210/bin
    vars: {}
";
