use crate::device::{self, DeviceSet};
use crate::error::{Result, SweepError};
use crate::spec::{BindingValue, SweepSpec};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// One point of the sweep: everything needed to provision and launch a run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunConfig {
    pub run_index: usize,
    pub label: String,
    pub environment_name: String,
    pub seed: u64,
    pub axis_values: IndexMap<String, BindingValue>,
    /// Sweep-level bindings first; axis values replace them on key collision.
    pub bindings: IndexMap<String, BindingValue>,
    pub device: Option<DeviceSet>,
    pub output_dir: PathBuf,
    pub dataset_dir: Option<PathBuf>,
}

impl RunConfig {
    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join("stream.log")
    }
}

pub struct ParameterSweep<'a> {
    spec: &'a SweepSpec,
    total: usize,
}

impl<'a> ParameterSweep<'a> {
    pub fn new(spec: &'a SweepSpec) -> Result<Self> {
        spec.validate()?;
        let total = spec
            .hyperparameter_axes
            .values()
            .try_fold(spec.seeds.len(), |acc, values| acc.checked_mul(values.len()))
            .ok_or_else(|| SweepError::config("sweep has more runs than can be counted"))?;
        Ok(Self { spec, total })
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily yields runs: the first declared axis varies slowest, seeds vary
    /// fastest. Devices are left unassigned.
    pub fn iter(&self) -> SweepIter<'a> {
        SweepIter {
            spec: self.spec,
            next: 0,
            total: self.len(),
        }
    }

    /// Materializes the whole sweep, assigns devices and rejects label
    /// collisions. Nothing touches the filesystem here, so any error leaves
    /// no run half-started.
    pub fn expand(&self) -> Result<Vec<RunConfig>> {
        let total = self.len();
        let mut runs = Vec::with_capacity(total);
        let mut seen: HashMap<String, usize> = HashMap::new();
        for mut run in self.iter() {
            if let Some(first) = seen.insert(run.label.clone(), run.run_index) {
                return Err(SweepError::config(format!(
                    "runs {} and {} both resolve to label '{}'",
                    first, run.run_index, run.label
                )));
            }
            run.device = device::assign(
                run.run_index,
                run.seed,
                total,
                &self.spec.device_policy,
                self.spec.device_count,
            )?;
            runs.push(run);
        }
        Ok(runs)
    }
}

pub struct SweepIter<'a> {
    spec: &'a SweepSpec,
    next: usize,
    total: usize,
}

impl<'a> SweepIter<'a> {
    fn build(&self, run_index: usize) -> RunConfig {
        let spec = self.spec;
        let seed_count = spec.seeds.len();
        let seed = spec.seeds[run_index % seed_count];

        // Mixed-radix decode with the last axis as the fastest digit.
        let mut rest = run_index / seed_count;
        let mut picks: Vec<(String, BindingValue)> = spec
            .hyperparameter_axes
            .iter()
            .rev()
            .map(|(name, values)| {
                let value = values[rest % values.len()].clone();
                rest /= values.len();
                (name.clone(), value)
            })
            .collect();
        picks.reverse();
        let axis_values: IndexMap<String, BindingValue> = picks.into_iter().collect();

        let mut bindings = spec.extra_bindings.clone();
        for (key, value) in &axis_values {
            bindings.insert(key.clone(), value.clone());
        }

        let mut segments = vec![
            sanitize_segment(&spec.experiment_label),
            environment_descriptor(&spec.environment_name),
        ];
        for (name, value) in &axis_values {
            segments.push(sanitize_segment(&format!("{}={}", name, value)));
        }
        segments.push(seed.to_string());

        let mut output_dir = spec.base_output_root.clone();
        for segment in &segments {
            output_dir.push(segment);
        }

        let dataset_dir = spec.dataset_dir.as_ref().map(|template| {
            PathBuf::from(
                template
                    .replace("{env}", &spec.environment_name)
                    .replace("{seed}", &seed.to_string()),
            )
        });

        RunConfig {
            run_index,
            label: segments.join("/"),
            environment_name: spec.environment_name.clone(),
            seed,
            axis_values,
            bindings,
            device: None,
            output_dir,
            dataset_dir,
        }
    }
}

impl<'a> Iterator for SweepIter<'a> {
    type Item = RunConfig;

    fn next(&mut self) -> Option<RunConfig> {
        if self.next >= self.total {
            return None;
        }
        let run = self.build(self.next);
        self.next += 1;
        Some(run)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl<'a> ExactSizeIterator for SweepIter<'a> {}

pub fn environment_descriptor(environment_name: &str) -> String {
    sanitize_segment(environment_name)
}

/// Keeps a label segment usable as a single path component.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._=+-".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DevicePolicy;
    use crate::spec::SweepSpec;
    use std::collections::HashSet;
    use std::path::Path;

    fn spec(yaml: &str) -> SweepSpec {
        SweepSpec::from_yaml_str(yaml).expect("sweep parses")
    }

    #[test]
    fn yields_seeds_times_axis_values_with_unique_labels() {
        let s = spec(
            r#"
experiment_label: exp1
environment_name: offline_ant_umaze
seeds: [0, 1, 2]
hyperparameter_axes:
  agent_config.bc_coef: [0.05, 0.1, 0.5, 1.0]
base_output_root: /tmp/out
"#,
        );
        let runs = ParameterSweep::new(&s).unwrap().expand().expect("expand");
        assert_eq!(runs.len(), 12);
        let labels: HashSet<&String> = runs.iter().map(|r| &r.label).collect();
        assert_eq!(labels.len(), 12);
    }

    #[test]
    fn axis_is_outer_and_seed_is_inner() {
        let s = spec(
            r#"
experiment_label: exp1
environment_name: ant
seeds: [3, 4]
hyperparameter_axes:
  lr: [1, 2]
  tau: [a, b]
"#,
        );
        let order: Vec<(String, String, u64)> = ParameterSweep::new(&s)
            .unwrap()
            .iter()
            .map(|r| {
                (
                    r.axis_values["lr"].to_string(),
                    r.axis_values["tau"].to_string(),
                    r.seed,
                )
            })
            .collect();
        let expected: Vec<(String, String, u64)> = [
            ("1", "a", 3),
            ("1", "a", 4),
            ("1", "b", 3),
            ("1", "b", 4),
            ("2", "a", 3),
            ("2", "a", 4),
            ("2", "b", 3),
            ("2", "b", 4),
        ]
        .iter()
        .map(|(l, t, s)| (l.to_string(), t.to_string(), *s))
        .collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn seed_only_sweep_lays_out_one_dir_per_seed() {
        let s = spec(
            r#"
experiment_label: exp1
environment_name: offline_ant_umaze
seeds: [0, 1, 2]
base_output_root: /tmp/out
"#,
        );
        let runs = ParameterSweep::new(&s).unwrap().expand().expect("expand");
        let dirs: Vec<&Path> = runs.iter().map(|r| r.output_dir.as_path()).collect();
        assert_eq!(
            dirs,
            vec![
                Path::new("/tmp/out/exp1/offline_ant_umaze/0"),
                Path::new("/tmp/out/exp1/offline_ant_umaze/1"),
                Path::new("/tmp/out/exp1/offline_ant_umaze/2"),
            ]
        );
        assert_eq!(
            runs[1].log_path(),
            PathBuf::from("/tmp/out/exp1/offline_ant_umaze/1/stream.log")
        );
        assert_eq!(runs[2].label, "exp1/offline_ant_umaze/2");
    }

    #[test]
    fn swept_axis_adds_a_path_segment() {
        let s = spec(
            r#"
experiment_label: exp1
environment_name: ant
seeds: [0]
hyperparameter_axes:
  agent_config.bc_coef: [0.1]
base_output_root: /tmp/out
"#,
        );
        let run = ParameterSweep::new(&s).unwrap().iter().next().expect("one run");
        assert_eq!(
            run.output_dir,
            PathBuf::from("/tmp/out/exp1/ant/agent_config.bc_coef=0.1/0")
        );
    }

    #[test]
    fn axis_value_overrides_sweep_level_binding() {
        let s = spec(
            r#"
experiment_label: exp1
environment_name: ant
seeds: [0]
extra_bindings:
  agent_config.batch_size: 256
  agent_config.bc_coef: 0.0
hyperparameter_axes:
  agent_config.bc_coef: [0.5]
"#,
        );
        let run = ParameterSweep::new(&s).unwrap().iter().next().expect("run");
        let keys: Vec<&String> = run.bindings.keys().collect();
        assert_eq!(keys, vec!["agent_config.batch_size", "agent_config.bc_coef"]);
        assert_eq!(run.bindings["agent_config.bc_coef"], BindingValue::Float(0.5));
    }

    #[test]
    fn colliding_labels_fail_before_anything_else() {
        let s = spec(
            r#"
experiment_label: exp1
environment_name: ant
seeds: [0]
hyperparameter_axes:
  mode: ["a b", "a_b"]
"#,
        );
        let err = ParameterSweep::new(&s)
            .unwrap()
            .expand()
            .expect_err("labels collide");
        assert!(matches!(err, SweepError::Configuration(_)));
        assert!(err.to_string().contains("mode=a_b"), "{}", err);
    }

    #[test]
    fn empty_axis_is_rejected_up_front() {
        let s = spec(
            r#"
experiment_label: exp1
environment_name: ant
seeds: [0]
hyperparameter_axes:
  lr: []
"#,
        );
        assert!(matches!(
            ParameterSweep::new(&s),
            Err(SweepError::Configuration(_))
        ));
    }

    #[test]
    fn expansion_is_deterministic_including_devices() {
        let mut s = spec(
            r#"
experiment_label: exp1
environment_name: ant
seeds: [0, 1, 2]
hyperparameter_axes:
  lr: [0.1, 0.2]
"#,
        );
        s.device_policy = DevicePolicy::OffsetIndex(0);
        let sweep = ParameterSweep::new(&s).unwrap();
        let first = sweep.expand().expect("first");
        let second = sweep.expand().expect("second");
        assert_eq!(first, second);
        let devices: Vec<String> = first
            .iter()
            .map(|r| r.device.as_ref().unwrap().env_value())
            .collect();
        assert_eq!(devices, vec!["0", "1", "2", "3", "4", "5"]);
    }

    #[test]
    fn out_of_range_device_aborts_expansion() {
        let mut s = spec("experiment_label: e\nenvironment_name: ant\nseeds: [0, 1, 2]\n");
        s.device_policy = DevicePolicy::OffsetSeed(6);
        s.device_count = Some(8);
        let err = ParameterSweep::new(&s).unwrap().expand().expect_err("seed 2 -> 8");
        assert!(matches!(err, SweepError::Configuration(_)));
    }

    #[test]
    fn dataset_template_is_resolved_per_run() {
        let s = spec(
            r#"
experiment_label: e
environment_name: ant
seeds: [4]
dataset_dir: "/data/{env}/seed_{seed}"
"#,
        );
        let run = ParameterSweep::new(&s).unwrap().iter().next().unwrap();
        assert_eq!(run.dataset_dir, Some(PathBuf::from("/data/ant/seed_4")));
    }

    #[test]
    fn iterator_reports_exact_size() {
        let s = spec("experiment_label: e\nenvironment_name: ant\nseeds: [0, 1]\nhyperparameter_axes:\n  a: [1, 2, 3]\n");
        let sweep = ParameterSweep::new(&s).unwrap();
        let mut iter = sweep.iter();
        assert_eq!(iter.len(), 6);
        iter.next();
        assert_eq!(iter.len(), 5);
    }

    #[test]
    fn oversized_grid_is_a_configuration_error() {
        let mut s = spec("experiment_label: e\nenvironment_name: ant\nseeds: [0, 1]\n");
        let wide: Vec<BindingValue> = (0..1024).map(BindingValue::Int).collect();
        for axis in ["a", "b", "c", "d", "e", "f", "g"] {
            s.hyperparameter_axes.insert(axis.to_string(), wide.clone());
        }
        let err = ParameterSweep::new(&s).err().expect("2 * 1024^7 overflows");
        assert!(matches!(err, SweepError::Configuration(_)));
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_segment("a/b c"), "a_b_c");
        assert_eq!(sanitize_segment(".."), "_..");
        assert_eq!(sanitize_segment("lr=3e-4"), "lr=3e-4");
    }
}
