use crate::spec::LauncherSettings;
use crate::sweep::RunConfig;
use serde::Serialize;
use std::path::PathBuf;

/// Fully rendered command for one run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    /// Copy-pasteable rendering, used in logs and records only. The child is
    /// spawned from `program` + `args` directly, without a shell.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }
}

pub struct ConfigBindingBuilder<'a> {
    launcher: &'a LauncherSettings,
}

impl<'a> ConfigBindingBuilder<'a> {
    pub fn new(launcher: &'a LauncherSettings) -> Self {
        Self { launcher }
    }

    /// Flags every run carries, in fixed order.
    pub fn base_flags(&self, run: &RunConfig) -> Vec<String> {
        let flags = &self.launcher.flags;
        let mut out = vec![
            format!("{}={}", flags.env_name, run.environment_name),
            format!("{}={}", flags.seed, run.seed),
            format!("{}={}", flags.iterations, self.launcher.iteration_budget),
            format!("{}={}", flags.root_dir, run.output_dir.display()),
        ];
        if let Some(dataset) = &run.dataset_dir {
            out.push(format!("{}={}", flags.dataset_dir, dataset.display()));
        }
        out
    }

    /// One override flag per binding. Keys are already unique on the run.
    /// Each flag is a single argv entry, so values go through verbatim;
    /// quoting only happens when rendering [`Invocation::command_line`].
    pub fn binding_flags(&self, run: &RunConfig) -> Vec<String> {
        run.bindings
            .iter()
            .map(|(key, value)| format!("{}={}={}", self.launcher.flags.binding, key, value))
            .collect()
    }

    pub fn build(&self, run: &RunConfig) -> Invocation {
        let mut args = self.launcher.args.clone();
        args.extend(self.base_flags(run));
        args.extend(self.binding_flags(run));
        Invocation {
            program: self.launcher.program.clone(),
            args,
            working_dir: self.launcher.working_dir.clone(),
        }
    }
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
