//! Declarative experiment plans loaded from YAML.
//!
//! A plan names a cluster, run defaults and an ordered list of experiments.
//! Each experiment is a list of command templates; every step is fanned out to
//! all of the experiment's targets and awaited before the next one starts.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use dx_core::errors::{DxError, ErrorInfo};
use dx_core::ParamValue;
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterConfig, ServerSpec};
use crate::context::ExperimentContext;
use crate::dispatch::RunOpts;
use crate::grid::{GridParameter, ParameterSpec};
use crate::hash::stable_hash_string;
use crate::registry::{ExperimentOptions, ExperimentRegistry};
use crate::serde::from_yaml_str;
use crate::signal::ControlSignal;
use crate::template::CommandTemplate;

/// What a declarative experiment does when a step has failed targets and
/// `raise_on_rc` is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Retry the binding from the first step.
    Restart,
    /// Stop the run.
    #[default]
    Abort,
    /// Keep going with the next step.
    Ignore,
}

/// Which cluster servers an experiment targets. Absent means all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerSelection {
    /// The first N servers in inventory order.
    Count(usize),
    /// Servers by name, in the listed order.
    Names(Vec<String>),
}

/// One experiment as written in a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<ServerSelection>,
    /// Working directory applied to every target before the first step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Sweep options in declaration order; absent for setup experiments.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ordered_params")]
    pub params: Option<ParameterSpec>,
    #[serde(default = "ExperimentDecl::default_raise_on_rc")]
    pub raise_on_rc: bool,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    pub steps: Vec<String>,
}

impl ExperimentDecl {
    const fn default_raise_on_rc() -> bool {
        true
    }

    fn options(&self) -> ExperimentOptions {
        ExperimentOptions {
            raise_on_rc: self.raise_on_rc,
            max_attempts: self.max_attempts,
            command_timeout: self.command_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Run-level defaults; CLI flags override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
}

/// A complete plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub run: RunDefaults,
    pub experiments: Vec<ExperimentDecl>,
}

/// Loads a plan from disk and checks it end to end.
pub fn load_plan<P: AsRef<Path>>(path: P) -> Result<Plan, DxError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|err| {
        DxError::Serde(
            ErrorInfo::new("plan.read", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })?;
    Plan::from_yaml(&text).map_err(|err| err.with_context("path", path.display().to_string()))
}

impl Plan {
    /// Parses and validates a plan.
    pub fn from_yaml(text: &str) -> Result<Self, DxError> {
        let plan: Plan = from_yaml_str(text)?;
        plan.cluster.validate()?;
        plan.build_registry()?;
        Ok(plan)
    }

    /// Returns the deterministic hash associated with the plan contents.
    pub fn plan_hash(&self) -> Result<String, DxError> {
        stable_hash_string(self)
    }

    pub fn run_opts(&self) -> RunOpts {
        RunOpts {
            max_attempts: self.run.max_attempts,
            backoff: Duration::from_millis(self.run.backoff_ms),
            command_timeout: self.run.command_timeout_secs.map(Duration::from_secs),
            only: Vec::new(),
        }
    }

    pub fn experiment(&self, name: &str) -> Option<&ExperimentDecl> {
        self.experiments.iter().find(|decl| decl.name == name)
    }

    /// The servers an experiment declaration resolves to.
    pub fn servers_for(&self, decl: &ExperimentDecl) -> Result<Vec<ServerSpec>, DxError> {
        let servers = match &decl.servers {
            None => Ok(self.cluster.servers().to_vec()),
            Some(ServerSelection::Count(count)) => self.cluster.first(*count),
            Some(ServerSelection::Names(names)) => self.cluster.select(names),
        };
        servers.map_err(|err| err.with_context("experiment", decl.name.clone()))
    }

    /// Parses the steps of `decl` and checks them against its options and servers.
    pub fn templates_for(&self, decl: &ExperimentDecl) -> Result<Vec<CommandTemplate>, DxError> {
        if decl.steps.is_empty() {
            return Err(DxError::Config(
                ErrorInfo::new("plan.no_steps", "experiment declares no steps")
                    .with_context("experiment", decl.name.clone()),
            ));
        }
        let servers = self.servers_for(decl)?;
        let spec = decl.params.clone().unwrap_or_default();
        let mut templates = Vec::with_capacity(decl.steps.len());
        for (idx, step) in decl.steps.iter().enumerate() {
            let checked = CommandTemplate::parse(step)
                .and_then(|template| template.validate(&spec, &servers).map(|()| template));
            let template = checked.map_err(|err| {
                err.with_context("experiment", decl.name.clone())
                    .with_context("step", (idx + 1).to_string())
            })?;
            templates.push(template);
        }
        Ok(templates)
    }

    /// Registers every declared experiment, in file order.
    pub fn build_registry(&self) -> Result<ExperimentRegistry, DxError> {
        let mut registry = ExperimentRegistry::new();
        for decl in &self.experiments {
            let targets = self.servers_for(decl)?;
            let steps = self.templates_for(decl)?;
            let body = StepRunner {
                cwd: decl.cwd.clone(),
                steps,
                on_failure: decl.on_failure,
            };
            registry.register(
                decl.name.clone(),
                targets,
                decl.params.clone(),
                move |ctx| body.run(ctx),
                decl.options(),
            )?;
        }
        Ok(registry)
    }
}

struct StepRunner {
    cwd: Option<String>,
    steps: Vec<CommandTemplate>,
    on_failure: FailurePolicy,
}

impl StepRunner {
    fn run(&self, ctx: &mut ExperimentContext<'_>) -> Result<ControlSignal, DxError> {
        if let Some(dir) = &self.cwd {
            ctx.cd(dir);
        }
        let count = ctx.target_count();
        for (idx, step) in self.steps.iter().enumerate() {
            let commands = ctx
                .target_infos()
                .iter()
                .map(|info| step.render(ctx.binding(), info, count))
                .collect::<Result<Vec<_>, _>>()?;
            let result = ctx
                .run_on_all(|info| commands[info.index].clone())
                .wait_all();
            if result.all_succeeded() {
                continue;
            }
            ctx.check_exits(&result)?;
            let failed = result
                .failures()
                .map(|failure| format!("{} ({})", failure.target, failure.status))
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(step = idx + 1, %failed, policy = ?self.on_failure, "step failed");
            match self.on_failure {
                FailurePolicy::Restart => return Ok(ControlSignal::Restart),
                FailurePolicy::Abort => {
                    return Ok(ControlSignal::Abort(format!("step {} failed on {}", idx + 1, failed)))
                }
                FailurePolicy::Ignore => {}
            }
        }
        Ok(ControlSignal::Done)
    }
}

/// `params` is written as an ordered YAML mapping of option to values.
mod ordered_params {
    use super::*;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(spec: &Option<ParameterSpec>, serializer: S) -> Result<S::Ok, S::Error> {
        let params = spec.as_ref().map(ParameterSpec::parameters).unwrap_or_default();
        let mut map = serializer.serialize_map(Some(params.len()))?;
        for param in params {
            map.serialize_entry(&param.name, &param.values)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<ParameterSpec>, D::Error> {
        struct ParamsVisitor;

        impl<'de> Visitor<'de> for ParamsVisitor {
            type Value = Option<ParameterSpec>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of option names to lists of values")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut parameters = Vec::new();
                while let Some((name, values)) = access.next_entry::<String, Vec<ParamValue>>()? {
                    parameters.push(GridParameter { name, values });
                }
                Ok(Some(ParameterSpec::from_parameters(parameters)))
            }
        }

        deserializer.deserialize_any(ParamsVisitor)
    }
}
