//! Static mapping from environments to activation recipes and from every
//! [`StageKind`] to the environment and command it runs with.
//!
//! The registry is built once from the resolved configuration and is
//! read-only afterwards. Construction is exhaustive: a stage without a
//! binding, or a binding naming an unknown environment, is rejected up front
//! rather than discovered at dispatch time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::predictor::StageParams;
use crate::state_machine::StageKind;

/// Placeholders accepted inside an argument template.
const PLACEHOLDERS: &[&str] = &["output_dir", "work_dir", "inputs", "stage"];

/// How to activate one isolated runtime environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSpec {
    pub name: String,
    /// Interpreter the stage program is handed to (e.g. a venv's python).
    pub interpreter: Option<PathBuf>,
    /// Prepended to `PATH` for the child process.
    pub bin_dir: Option<PathBuf>,
    /// Declared dependency set; informational, never reconciled across environments.
    pub packages: Vec<String>,
    pub vars: BTreeMap<String, String>,
}

impl EnvironmentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interpreter: None,
            bin_dir: None,
            packages: Vec::new(),
            vars: BTreeMap::new(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_bin_dir(mut self, bin_dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(bin_dir.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Verifies the recipe can be activated on this host.
    pub fn check_activation(&self) -> Result<(), String> {
        if let Some(bin_dir) = &self.bin_dir {
            if !bin_dir.is_dir() {
                return Err(format!("bin dir {} does not exist", bin_dir.display()));
            }
        }
        if let Some(interpreter) = &self.interpreter {
            if resolve_program(interpreter, self.bin_dir.as_deref()).is_none() {
                return Err(format!("interpreter {} not found", interpreter.display()));
            }
        }
        Ok(())
    }
}

/// Which environment and command a stage runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageBinding {
    pub stage: StageKind,
    pub environment: String,
    pub program: String,
    pub args: Vec<String>,
    /// Verification-only stages may succeed without producing outputs.
    pub verification_only: bool,
}

impl StageBinding {
    pub fn new(stage: StageKind, environment: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            stage,
            environment: environment.into(),
            program: program.into(),
            args: Vec::new(),
            verification_only: false,
        }
    }

    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn verification_only(mut self) -> Self {
        self.verification_only = true;
        self
    }

    /// Expands the argument template. `{inputs}` as a whole argument expands
    /// to one argument per input path.
    pub fn render_args(
        &self,
        output_dir: &Path,
        work_dir: &Path,
        inputs: &[PathBuf],
        params: &StageParams,
    ) -> Vec<String> {
        let mut rendered = Vec::with_capacity(self.args.len() + inputs.len());
        for arg in &self.args {
            if arg == "{inputs}" {
                rendered.extend(inputs.iter().map(|p| p.display().to_string()));
                continue;
            }
            let joined_inputs = inputs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let mut value = arg
                .replace("{output_dir}", &output_dir.display().to_string())
                .replace("{work_dir}", &work_dir.display().to_string())
                .replace("{inputs}", &joined_inputs)
                .replace("{stage}", self.stage.name());
            for (name, param) in params.as_pairs() {
                value = value.replace(&format!("{{param.{name}}}"), &param);
            }
            rendered.push(value);
        }
        rendered
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.program.trim().is_empty() {
            return Err(PipelineError::Config(format!(
                "stage `{}` has an empty program",
                self.stage
            )));
        }
        for arg in &self.args {
            for placeholder in placeholders_in(arg) {
                let known = PLACEHOLDERS.contains(&placeholder)
                    || placeholder
                        .strip_prefix("param.")
                        .map(|p| StageParams::NAMES.contains(&p))
                        .unwrap_or(false);
                if !known {
                    return Err(PipelineError::Config(format!(
                        "stage `{}`: unknown placeholder `{{{placeholder}}}`",
                        self.stage
                    )));
                }
            }
        }
        Ok(())
    }
}

fn placeholders_in(arg: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                found.push(&after[..end]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    found
}

/// Read-only registry of environments and stage bindings.
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    environments: BTreeMap<String, EnvironmentSpec>,
    bindings: BTreeMap<StageKind, StageBinding>,
}

impl EnvironmentRegistry {
    /// Builds and validates the registry. Every [`StageKind`] must be bound.
    pub fn new(
        environments: impl IntoIterator<Item = EnvironmentSpec>,
        bindings: impl IntoIterator<Item = StageBinding>,
    ) -> PipelineResult<Self> {
        let environments: BTreeMap<_, _> = environments
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();
        let bindings: BTreeMap<_, _> = bindings.into_iter().map(|b| (b.stage, b)).collect();

        for kind in StageKind::ALL {
            let binding = bindings.get(&kind).ok_or_else(|| {
                PipelineError::Config(format!("stage `{kind}` has no environment binding"))
            })?;
            if !environments.contains_key(&binding.environment) {
                return Err(PipelineError::Config(format!(
                    "stage `{kind}` requires unknown environment `{}`",
                    binding.environment
                )));
            }
            binding.validate()?;
        }

        Ok(Self {
            environments,
            bindings,
        })
    }

    /// Reads `environments.<name>.*` and `stages.<stage>.*` keys.
    pub fn from_config(config: &ResolvedConfig) -> PipelineResult<Self> {
        let mut environments = Vec::new();
        for name in config.children("environments") {
            let prefix = format!("environments.{name}");
            let mut spec = EnvironmentSpec::new(name.clone());
            spec.interpreter = config
                .get_opt(&format!("{prefix}.interpreter"))
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from);
            spec.bin_dir = config
                .get_opt(&format!("{prefix}.bin_dir"))
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from);
            spec.packages = config.get_list(&format!("{prefix}.packages"));
            let vars_prefix = format!("{prefix}.vars");
            for var in config.children(&vars_prefix) {
                if let Some(value) = config.get_opt(&format!("{vars_prefix}.{var}")) {
                    spec.vars.insert(var.clone(), value.to_string());
                }
            }
            environments.push(spec);
        }

        let mut bindings = Vec::new();
        for kind in StageKind::ALL {
            let prefix = format!("stages.{}", kind.name());
            let (Some(environment), Some(program)) = (
                config.get_opt(&format!("{prefix}.environment")),
                config.get_opt(&format!("{prefix}.program")),
            ) else {
                continue;
            };
            let mut binding = StageBinding::new(kind, environment, program).with_args(
                config
                    .get_opt(&format!("{prefix}.args"))
                    .unwrap_or_default()
                    .split_whitespace(),
            );
            let verification_key = format!("{prefix}.verification_only");
            if config.get_opt(&verification_key).is_some() {
                binding.verification_only = config.get_bool(&verification_key)?;
            }
            bindings.push(binding);
        }

        Self::new(environments, bindings)
    }

    pub fn binding(&self, stage: StageKind) -> PipelineResult<&StageBinding> {
        self.bindings
            .get(&stage)
            .ok_or_else(|| PipelineError::EnvironmentUnavailable {
                stage: stage.to_string(),
                reason: "no registry entry".into(),
            })
    }

    /// The environment `stage` must run in, and nothing else.
    pub fn environment_for(&self, stage: StageKind) -> PipelineResult<&EnvironmentSpec> {
        let binding = self.binding(stage)?;
        self.environments
            .get(&binding.environment)
            .ok_or_else(|| PipelineError::EnvironmentUnavailable {
                stage: stage.to_string(),
                reason: format!("environment `{}` is not registered", binding.environment),
            })
    }

    pub fn environments(&self) -> impl Iterator<Item = &EnvironmentSpec> {
        self.environments.values()
    }
}

/// Finds an executable `program` either as a path or on `PATH` (after
/// `bin_dir`). Files without execute permission are passed over.
pub fn resolve_program(program: &Path, bin_dir: Option<&Path>) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = bin_dir.map(Path::to_path_buf).into_iter().collect();
    if let Some(path) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path));
    }
    let search = std::env::join_paths(dirs).ok()?;
    let cwd = std::env::current_dir().ok()?;
    which::which_in(program, Some(search), cwd).ok()
}
