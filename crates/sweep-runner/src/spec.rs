//! Declarative sweep files.
//!
//! A sweep file replaces one hand-written launch script: it names the
//! experiment, the environment, the seeds, the hyperparameter axes and how
//! the training binary is invoked.

use crate::device::DevicePolicy;
use crate::error::{Result, SweepError};
use crate::fsutil::io_err;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A scalar override value. Sequences and maps are rejected at load time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl BindingValue {
    /// Parses a command-line value: YAML scalars keep their type, anything
    /// else becomes a string.
    pub fn parse_cli(raw: &str) -> Self {
        match serde_yaml::from_str::<BindingValue>(raw) {
            Ok(v) => v,
            Err(_) => BindingValue::Str(raw.to_string()),
        }
    }
}

impl fmt::Display for BindingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingValue::Bool(b) => write!(f, "{}", b),
            BindingValue::Int(i) => write!(f, "{}", i),
            // Debug keeps the trailing `.0` so 1.0 does not turn into an int.
            BindingValue::Float(x) => write!(f, "{:?}", x),
            BindingValue::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlagNames {
    #[serde(default = "default_env_flag")]
    pub env_name: String,
    #[serde(default = "default_seed_flag")]
    pub seed: String,
    #[serde(default = "default_iterations_flag")]
    pub iterations: String,
    #[serde(default = "default_root_flag")]
    pub root_dir: String,
    #[serde(default = "default_dataset_flag")]
    pub dataset_dir: String,
    #[serde(default = "default_override_flag")]
    pub binding: String,
}

fn default_env_flag() -> String {
    "--env_name".to_string()
}
fn default_seed_flag() -> String {
    "--seed".to_string()
}
fn default_iterations_flag() -> String {
    "--max_number_of_steps".to_string()
}
fn default_root_flag() -> String {
    "--root_dir".to_string()
}
fn default_dataset_flag() -> String {
    "--data_load_dir".to_string()
}
fn default_override_flag() -> String {
    "--config_override".to_string()
}

impl Default for FlagNames {
    fn default() -> Self {
        Self {
            env_name: default_env_flag(),
            seed: default_seed_flag(),
            iterations: default_iterations_flag(),
            root_dir: default_root_flag(),
            dataset_dir: default_dataset_flag(),
            binding: default_override_flag(),
        }
    }
}

/// Environment handed to every child on top of the orchestrator's own.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSettings {
    /// Exported as `PYTHONPATH`.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    /// Appended to the inherited `LD_LIBRARY_PATH`.
    #[serde(default)]
    pub library_paths: Vec<PathBuf>,
    /// Explicit variables; these win over the built-in defaults.
    #[serde(default)]
    pub vars: IndexMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LauncherSettings {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_iteration_budget")]
    pub iteration_budget: u64,
    #[serde(default)]
    pub flags: FlagNames,
    #[serde(default = "default_device_env")]
    pub device_env: String,
    /// Build-lock marker left behind by the simulation backend.
    #[serde(default)]
    pub lock_artifact: Option<PathBuf>,
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_seconds: u64,
    #[serde(default = "default_stagger")]
    pub stagger_seconds: f64,
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub environment: EnvironmentSettings,
}

fn default_program() -> String {
    "python".to_string()
}
fn default_iteration_budget() -> u64 {
    1_000_000
}
fn default_device_env() -> String {
    "CUDA_VISIBLE_DEVICES".to_string()
}
fn default_gate_timeout() -> u64 {
    300
}
fn default_stagger() -> f64 {
    5.0
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            working_dir: None,
            iteration_budget: default_iteration_budget(),
            flags: FlagNames::default(),
            device_env: default_device_env(),
            lock_artifact: None,
            gate_timeout_seconds: default_gate_timeout(),
            stagger_seconds: default_stagger(),
            overwrite_existing: false,
            strict: false,
            environment: EnvironmentSettings::default(),
        }
    }
}

impl LauncherSettings {
    pub fn stagger(&self) -> Duration {
        Duration::from_secs_f64(self.stagger_seconds)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_seconds)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepSpec {
    pub experiment_label: String,
    pub environment_name: String,
    pub seeds: Vec<u64>,
    /// Swept in declared order: the first axis varies slowest.
    #[serde(default)]
    pub hyperparameter_axes: IndexMap<String, Vec<BindingValue>>,
    #[serde(default = "default_output_root")]
    pub base_output_root: PathBuf,
    #[serde(default)]
    pub extra_bindings: IndexMap<String, BindingValue>,
    /// May contain `{env}` and `{seed}` placeholders.
    #[serde(default)]
    pub dataset_dir: Option<String>,
    #[serde(default)]
    pub device_policy: DevicePolicy,
    /// Devices `0..device_count` are valid when set.
    #[serde(default)]
    pub device_count: Option<u32>,
    #[serde(default)]
    pub launcher: LauncherSettings,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("runs")
}

/// Values given on the command line. Each `Some` replaces the file's value;
/// `set_bindings` and `axes` are merged on top of the file's entries.
#[derive(Clone, Debug, Default)]
pub struct SweepOverrides {
    pub experiment_label: Option<String>,
    pub environment_name: Option<String>,
    pub seeds: Option<Vec<u64>>,
    pub axes: Vec<(String, Vec<BindingValue>)>,
    pub set_bindings: Vec<(String, BindingValue)>,
    pub base_output_root: Option<PathBuf>,
    pub device_policy: Option<DevicePolicy>,
    pub device_count: Option<u32>,
    pub stagger_seconds: Option<f64>,
    pub overwrite_existing: bool,
    pub strict: bool,
}

impl SweepSpec {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let spec: SweepSpec = serde_yaml::from_str(raw)?;
        Ok(spec)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(io_err(path))?;
        Self::from_yaml_str(&raw)
    }

    /// Builds a spec purely from command-line values, for sweeps without a
    /// file.
    pub fn from_overrides(overrides: &SweepOverrides) -> Result<Self> {
        let experiment_label = overrides
            .experiment_label
            .clone()
            .ok_or_else(|| SweepError::config("missing --experiment-label (no sweep file given)"))?;
        let environment_name = overrides
            .environment_name
            .clone()
            .ok_or_else(|| SweepError::config("missing --env-name (no sweep file given)"))?;
        let seeds = overrides
            .seeds
            .clone()
            .ok_or_else(|| SweepError::config("missing --seeds (no sweep file given)"))?;
        Ok(SweepSpec {
            experiment_label,
            environment_name,
            seeds,
            hyperparameter_axes: IndexMap::new(),
            base_output_root: default_output_root(),
            extra_bindings: IndexMap::new(),
            dataset_dir: None,
            device_policy: DevicePolicy::None,
            device_count: None,
            launcher: LauncherSettings::default(),
        })
    }

    pub fn apply_overrides(&mut self, overrides: &SweepOverrides) {
        if let Some(label) = &overrides.experiment_label {
            self.experiment_label = label.clone();
        }
        if let Some(env) = &overrides.environment_name {
            self.environment_name = env.clone();
        }
        if let Some(seeds) = &overrides.seeds {
            self.seeds = seeds.clone();
        }
        for (name, values) in &overrides.axes {
            self.hyperparameter_axes.insert(name.clone(), values.clone());
        }
        for (key, value) in &overrides.set_bindings {
            self.extra_bindings.insert(key.clone(), value.clone());
        }
        if let Some(root) = &overrides.base_output_root {
            self.base_output_root = root.clone();
        }
        if let Some(policy) = &overrides.device_policy {
            self.device_policy = policy.clone();
        }
        if overrides.device_count.is_some() {
            self.device_count = overrides.device_count;
        }
        if let Some(stagger) = overrides.stagger_seconds {
            self.launcher.stagger_seconds = stagger;
        }
        if overrides.overwrite_existing {
            self.launcher.overwrite_existing = true;
        }
        if overrides.strict {
            self.launcher.strict = true;
        }
    }

    /// Expands `~/` in every path-like field.
    pub fn expand_paths(&mut self) {
        self.base_output_root = expand_home(&self.base_output_root);
        self.dataset_dir = self
            .dataset_dir
            .take()
            .map(|dir| expand_home(Path::new(&dir)).to_string_lossy().to_string());
        let launcher = &mut self.launcher;
        launcher.working_dir = launcher.working_dir.as_deref().map(expand_home);
        launcher.lock_artifact = launcher.lock_artifact.as_deref().map(expand_home);
        let env = &mut launcher.environment;
        env.project_root = env.project_root.as_deref().map(expand_home);
        env.library_paths = env.library_paths.iter().map(|p| expand_home(p)).collect();
    }

    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.experiment_label.trim().is_empty() {
            missing.push("experiment_label must not be empty".to_string());
        }
        if self.environment_name.trim().is_empty() {
            missing.push("environment_name must not be empty".to_string());
        }
        if self.seeds.is_empty() {
            missing.push("seeds must list at least one seed".to_string());
        }
        let mut seen = BTreeSet::new();
        for seed in &self.seeds {
            if !seen.insert(*seed) {
                missing.push(format!("seed {} is listed more than once", seed));
            }
        }
        for (axis, values) in &self.hyperparameter_axes {
            if axis.trim().is_empty() {
                missing.push("hyperparameter axis names must not be empty".to_string());
            }
            if values.is_empty() {
                missing.push(format!("hyperparameter axis '{}' has no values", axis));
            }
        }
        for key in self.extra_bindings.keys() {
            if key.trim().is_empty() {
                missing.push("binding keys must not be empty".to_string());
            }
        }
        if self.launcher.program.trim().is_empty() {
            missing.push("launcher.program must not be empty".to_string());
        }
        if !self.launcher.stagger_seconds.is_finite() || self.launcher.stagger_seconds < 0.0 {
            missing.push(format!(
                "launcher.stagger_seconds must be a non-negative number (got {})",
                self.launcher.stagger_seconds
            ));
        }
        match &self.device_policy {
            DevicePolicy::Fixed(list) | DevicePolicy::RoundRobin(list) if list.is_empty() => {
                missing.push(format!(
                    "device_policy '{}' needs at least one device id",
                    self.device_policy.as_string()
                ));
            }
            _ => {}
        }
        if self.launcher.device_env.trim().is_empty() {
            missing.push("launcher.device_env must not be empty".to_string());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SweepError::Configuration(missing.join("; ")))
        }
    }

    /// sha256 over the resolved spec, recorded next to every launch.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }
}

pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Parses `name=v1,v2,...` as given to `--axis`.
pub fn parse_axis_arg(raw: &str) -> Result<(String, Vec<BindingValue>)> {
    let (name, values) = raw
        .split_once('=')
        .ok_or_else(|| SweepError::config(format!("invalid --axis '{}': expected name=v1,v2", raw)))?;
    if name.trim().is_empty() {
        return Err(SweepError::config(format!(
            "invalid --axis '{}': name cannot be empty",
            raw
        )));
    }
    let values: Vec<BindingValue> = values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(BindingValue::parse_cli)
        .collect();
    Ok((name.trim().to_string(), values))
}

/// Parses `key=value` as given to `--set`.
pub fn parse_set_arg(raw: &str) -> Result<(String, BindingValue)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| SweepError::config(format!("invalid --set '{}': expected k=v", raw)))?;
    if key.trim().is_empty() {
        return Err(SweepError::config(format!(
            "invalid --set '{}': key cannot be empty",
            raw
        )));
    }
    Ok((key.trim().to_string(), BindingValue::parse_cli(value)))
}

/// Largest seed range accepted from `--seeds lo-hi`.
pub const MAX_SEED_RANGE: u64 = 10_000;

/// Parses `0,1,2` or `0-4` (inclusive) seed lists.
pub fn parse_seeds_arg(raw: &str) -> Result<Vec<u64>> {
    let mut seeds = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let bad = || SweepError::config(format!("invalid seed list entry '{}'", part));
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u64 = lo.trim().parse().map_err(|_| bad())?;
            let hi: u64 = hi.trim().parse().map_err(|_| bad())?;
            if hi < lo {
                return Err(bad());
            }
            if hi - lo >= MAX_SEED_RANGE {
                return Err(SweepError::config(format!(
                    "seed range '{}' spans more than {} seeds",
                    part, MAX_SEED_RANGE
                )));
            }
            seeds.extend(lo..=hi);
        } else {
            seeds.push(part.parse().map_err(|_| bad())?);
        }
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWEEP: &str = r#"
experiment_label: exp1
environment_name: offline_ant_umaze
seeds: [0, 1, 2]
hyperparameter_axes:
  agent_config.bc_coef: [0.05, 0.1]
  agent_config.use_td: [true]
extra_bindings:
  agent_config.batch_size: 256
  agent_config.entropy_coefficient: 0.0
base_output_root: /tmp/out
device_policy: offset-seed:5
launcher:
  args: [lp_contrastive.py, --lp_launch_type=local_mp]
  stagger_seconds: 2
"#;

    #[test]
    fn sweep_file_parses_with_defaults() {
        let spec = SweepSpec::from_yaml_str(SWEEP).expect("parse");
        spec.validate().expect("valid");
        assert_eq!(spec.seeds, vec![0, 1, 2]);
        let axes: Vec<&String> = spec.hyperparameter_axes.keys().collect();
        assert_eq!(axes, vec!["agent_config.bc_coef", "agent_config.use_td"]);
        assert_eq!(
            spec.hyperparameter_axes["agent_config.use_td"],
            vec![BindingValue::Bool(true)]
        );
        assert_eq!(spec.device_policy, DevicePolicy::OffsetSeed(5));
        assert_eq!(spec.launcher.program, "python");
        assert_eq!(spec.launcher.device_env, "CUDA_VISIBLE_DEVICES");
        assert_eq!(spec.launcher.stagger(), Duration::from_secs(2));
        assert_eq!(spec.launcher.flags.seed, "--seed");
    }

    #[test]
    fn launcher_defaults_match_the_launch_scripts() {
        let launcher = LauncherSettings::default();
        assert_eq!(launcher.stagger(), Duration::from_secs(5));
        assert_eq!(launcher.iteration_budget, 1_000_000);
        let spec = SweepSpec::from_yaml_str("experiment_label: e\nenvironment_name: ant\nseeds: [0]\n")
            .expect("parse");
        assert_eq!(spec.launcher.stagger(), Duration::from_secs(5));
    }

    #[test]
    fn validation_reports_every_problem() {
        let spec = SweepSpec::from_yaml_str(
            r#"
experiment_label: ""
environment_name: ant
seeds: [1, 1]
hyperparameter_axes:
  lr: []
"#,
        )
        .expect("parse");
        let msg = spec.validate().expect_err("invalid").to_string();
        assert!(msg.contains("experiment_label"), "{}", msg);
        assert!(msg.contains("seed 1 is listed more than once"), "{}", msg);
        assert!(msg.contains("axis 'lr' has no values"), "{}", msg);
    }

    #[test]
    fn empty_device_lists_are_rejected() {
        for policy in [DevicePolicy::Fixed(vec![]), DevicePolicy::RoundRobin(vec![])] {
            let mut spec = SweepSpec::from_yaml_str(SWEEP).expect("parse");
            spec.device_policy = policy;
            let msg = spec.validate().expect_err("empty list").to_string();
            assert!(msg.contains("needs at least one device id"), "{}", msg);
        }
    }

    #[test]
    fn non_scalar_axis_values_are_rejected() {
        let err = SweepSpec::from_yaml_str(
            r#"
experiment_label: e
environment_name: ant
seeds: [0]
hyperparameter_axes:
  lr: [[1, 2]]
"#,
        )
        .expect_err("nested list");
        assert!(matches!(err, SweepError::Configuration(_)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = SweepSpec::from_yaml_str("experiment_label: e\nenvironment_name: a\nseeds: [0]\nseed: 1\n")
            .expect_err("typo");
        assert!(err.to_string().contains("seed"), "{}", err);
    }

    #[test]
    fn overrides_replace_and_merge() {
        let mut spec = SweepSpec::from_yaml_str(SWEEP).expect("parse");
        spec.apply_overrides(&SweepOverrides {
            experiment_label: Some("exp2".to_string()),
            seeds: Some(vec![7]),
            set_bindings: vec![(
                "agent_config.batch_size".to_string(),
                BindingValue::Int(512),
            )],
            axes: vec![("agent_config.lr".to_string(), vec![BindingValue::Float(3e-4)])],
            stagger_seconds: Some(0.0),
            overwrite_existing: true,
            ..Default::default()
        });
        assert_eq!(spec.experiment_label, "exp2");
        assert_eq!(spec.seeds, vec![7]);
        assert_eq!(
            spec.extra_bindings["agent_config.batch_size"],
            BindingValue::Int(512)
        );
        assert_eq!(spec.hyperparameter_axes.len(), 3);
        assert!(spec.launcher.overwrite_existing);
        assert_eq!(spec.launcher.stagger(), Duration::ZERO);
    }

    #[test]
    fn spec_without_file_needs_label_env_and_seeds() {
        let err = SweepSpec::from_overrides(&SweepOverrides::default()).expect_err("empty");
        assert!(err.to_string().contains("--experiment-label"), "{}", err);
        let spec = SweepSpec::from_overrides(&SweepOverrides {
            experiment_label: Some("e".to_string()),
            environment_name: Some("ant".to_string()),
            seeds: Some(vec![0]),
            ..Default::default()
        })
        .expect("spec");
        spec.validate().expect("valid");
    }

    #[test]
    fn cli_values_keep_scalar_types() {
        assert_eq!(BindingValue::parse_cli("3"), BindingValue::Int(3));
        assert_eq!(BindingValue::parse_cli("0.5"), BindingValue::Float(0.5));
        assert_eq!(BindingValue::parse_cli("false"), BindingValue::Bool(false));
        assert_eq!(
            BindingValue::parse_cli("a b"),
            BindingValue::Str("a b".to_string())
        );
        assert_eq!(BindingValue::Float(1.0).to_string(), "1.0");
    }

    #[test]
    fn axis_set_and_seed_args_parse() {
        let (name, values) = parse_axis_arg("lr=0.1,0.2").expect("axis");
        assert_eq!(name, "lr");
        assert_eq!(values, vec![BindingValue::Float(0.1), BindingValue::Float(0.2)]);
        assert!(parse_axis_arg("lr").is_err());
        assert!(parse_axis_arg("=1").is_err());

        let (key, value) = parse_set_arg("agent.name=c learning").expect("set");
        assert_eq!(key, "agent.name");
        assert_eq!(value, BindingValue::Str("c learning".to_string()));
        assert!(parse_set_arg("novalue").is_err());

        assert_eq!(parse_seeds_arg("0-2,5").expect("seeds"), vec![0, 1, 2, 5]);
        assert!(parse_seeds_arg("3-1").is_err());
        assert_eq!(parse_seeds_arg("0-9999").expect("at the cap").len(), 10_000);
        let err = parse_seeds_arg("0-18446744073709551615").expect_err("huge range");
        assert!(matches!(err, SweepError::Configuration(_)));
        assert!(parse_seeds_arg("x").is_err());
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let a = SweepSpec::from_yaml_str(SWEEP).expect("parse");
        let mut b = a.clone();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        b.seeds.push(3);
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
        assert!(a.digest().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn home_prefix_expands() {
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/logs")),
                PathBuf::from(home).join("logs")
            );
        }
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
