use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dx_core::errors::{DxError, ErrorInfo};
use serde::{Deserialize, Serialize};

use crate::cluster::ServerSpec;
use crate::context::ExperimentContext;
use crate::grid::{GridIter, ParameterGrid, ParameterSpec};
use crate::signal::ControlSignal;

/// Body of an experiment, invoked once per binding (and again on restart).
pub type ExperimentFn =
    Arc<dyn Fn(&mut ExperimentContext<'_>) -> Result<ControlSignal, DxError> + Send + Sync>;

/// Per-experiment execution policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentOptions {
    /// Abort the whole run on the first unsuccessful command.
    pub raise_on_rc: bool,
    /// Cap on attempts per binding; falls back to the run-level value.
    pub max_attempts: Option<u32>,
    /// Deadline for each launched command; falls back to the run-level value.
    pub command_timeout: Option<Duration>,
}

impl Default for ExperimentOptions {
    fn default() -> Self {
        Self {
            raise_on_rc: true,
            max_attempts: None,
            command_timeout: None,
        }
    }
}

impl ExperimentOptions {
    /// Options for benchmarks that inspect exit codes themselves.
    pub fn lenient() -> Self {
        Self {
            raise_on_rc: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }
}

/// Whether an experiment runs once or once per grid binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentShape {
    /// No parameters; a single instance (compile, deploy, warm-up).
    Setup,
    /// One instance per binding of its parameter grid.
    Sweep,
}

/// A registered, immutable experiment.
#[derive(Clone)]
pub struct Experiment {
    name: String,
    targets: Vec<ServerSpec>,
    shape: ExperimentShape,
    grid: ParameterGrid,
    function: ExperimentFn,
    options: ExperimentOptions,
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .field("targets", &self.targets.len())
            .field("shape", &self.shape)
            .field("instances", &self.grid.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Experiment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[ServerSpec] {
        &self.targets
    }

    pub fn shape(&self) -> ExperimentShape {
        self.shape
    }

    /// The expansion grid; setup experiments carry an empty one.
    pub fn grid(&self) -> &ParameterGrid {
        &self.grid
    }

    pub fn options(&self) -> &ExperimentOptions {
        &self.options
    }

    pub fn instance_count(&self) -> usize {
        self.grid.len()
    }

    /// Bindings in execution order. Setup experiments yield one empty binding.
    pub fn bindings(&self) -> GridIter<'_> {
        self.grid.iter()
    }

    pub(crate) fn invoke(&self, ctx: &mut ExperimentContext<'_>) -> Result<ControlSignal, DxError> {
        (self.function)(ctx)
    }
}

/// Experiments in declaration order.
///
/// Everything is registered before anything runs; the dispatcher only ever
/// borrows the registry immutably.
#[derive(Debug, Clone, Default)]
pub struct ExperimentRegistry {
    experiments: Vec<Experiment>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an experiment. `spec` of `None` makes a setup experiment.
    ///
    /// Duplicate or blank names, duplicate targets, an invalid parameter spec
    /// and a zero attempt cap are configuration errors.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        targets: Vec<ServerSpec>,
        spec: Option<ParameterSpec>,
        function: F,
        options: ExperimentOptions,
    ) -> Result<&Experiment, DxError>
    where
        F: Fn(&mut ExperimentContext<'_>) -> Result<ControlSignal, DxError> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DxError::Config(ErrorInfo::new(
                "registry.blank_name",
                "experiment name must not be empty",
            )));
        }
        if self.get(&name).is_some() {
            return Err(DxError::Config(
                ErrorInfo::new("registry.duplicate", "experiment already registered")
                    .with_context("name", name),
            ));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = targets.iter().find(|server| !seen.insert(server.name.as_str())) {
            return Err(DxError::Config(
                ErrorInfo::new("registry.duplicate_target", "target listed twice")
                    .with_context("name", name.clone())
                    .with_context("target", dup.name.clone()),
            ));
        }
        if options.max_attempts == Some(0) {
            return Err(DxError::Config(
                ErrorInfo::new("registry.zero_attempts", "max_attempts must be at least 1")
                    .with_context("name", name),
            ));
        }
        let shape = match spec {
            Some(_) => ExperimentShape::Sweep,
            None => ExperimentShape::Setup,
        };
        let grid = ParameterGrid::new(spec.unwrap_or_default())
            .map_err(|err| err.with_context("experiment", name.clone()))?;
        tracing::debug!(experiment = %name, ?shape, instances = grid.len(), "registered");
        self.experiments.push(Experiment {
            name,
            targets,
            shape,
            grid,
            function: Arc::new(function),
            options,
        });
        let idx = self.experiments.len() - 1;
        Ok(&self.experiments[idx])
    }

    /// Experiments in registration order.
    pub fn list_experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    pub fn get(&self, name: &str) -> Option<&Experiment> {
        self.experiments.iter().find(|exp| exp.name == name)
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}
