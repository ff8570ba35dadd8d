use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dx_core::errors::{DxError, ErrorInfo};

use crate::context::{nonzero_exit, ExperimentContext};
use crate::fanout::{CommandFanout, CommandLog, FailureLatch};
use crate::grid::ParameterBinding;
use crate::hash::instance_id;
use crate::registry::{Experiment, ExperimentRegistry};
use crate::report::{timestamp, ExperimentReport, InstanceReport, InstanceState, RunReport};
use crate::signal::ControlSignal;
use crate::target::{RemoteTarget, TargetInfo, Transport, UnreachableTarget};

/// Run-level defaults; experiment options take precedence where set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunOpts {
    /// Attempts per binding before giving up. `None` retries without bound.
    pub max_attempts: Option<u32>,
    /// Pause between a restart and the next attempt.
    pub backoff: Duration,
    /// Deadline applied to every launched command. `None` waits forever.
    pub command_timeout: Option<Duration>,
    /// Run only these experiments (registration order is kept). Empty runs all.
    pub only: Vec<String>,
}

/// Drives experiments instance by instance.
pub struct Dispatcher<'t> {
    transport: &'t dyn Transport,
    opts: RunOpts,
}

impl<'t> Dispatcher<'t> {
    pub fn new(transport: &'t dyn Transport, opts: RunOpts) -> Self {
        Self { transport, opts }
    }

    pub fn opts(&self) -> &RunOpts {
        &self.opts
    }

    /// Runs every selected experiment in registration order, stopping at the
    /// first fatal condition. The report always covers what ran.
    pub fn run_all(&self, registry: &ExperimentRegistry) -> RunReport {
        let mut report = RunReport::new();
        for name in &self.opts.only {
            if registry.get(name).is_none() {
                report.error = Some(DxError::Config(
                    ErrorInfo::new("dispatch.unknown_experiment", "no experiment with that name")
                        .with_context("name", name.clone()),
                ));
                return report;
            }
        }
        for experiment in registry.list_experiments() {
            if !self.opts.only.is_empty() && !self.opts.only.iter().any(|n| n == experiment.name()) {
                tracing::debug!(experiment = experiment.name(), "skipped by filter");
                continue;
            }
            let mut section = empty_section(experiment);
            let outcome = self.run_into(experiment, &mut section);
            report.experiments.push(section);
            if let Err(err) = outcome {
                tracing::error!(error = %err, "run aborted");
                report.error = Some(err);
                break;
            }
        }
        report
    }

    /// Runs one experiment: every binding in order, each to completion.
    pub fn run(&self, experiment: &Experiment) -> Result<ExperimentReport, DxError> {
        let mut section = empty_section(experiment);
        self.run_into(experiment, &mut section)?;
        Ok(section)
    }

    #[tracing::instrument(level = "info", skip_all, fields(experiment = %experiment.name()))]
    fn run_into(&self, experiment: &Experiment, section: &mut ExperimentReport) -> Result<(), DxError> {
        tracing::info!(instances = experiment.instance_count(), "starting experiment");
        for (index, binding) in experiment.bindings().enumerate() {
            let instance = self.run_instance(experiment, index, binding)?;
            let failed = instance.state == InstanceState::Failed;
            let error = instance.error.clone();
            section.instances.push(instance);
            if failed {
                return Err(match error {
                    Some(info) => DxError::Dispatch(info),
                    None => DxError::dispatch("dispatch.failed", "instance failed"),
                });
            }
        }
        tracing::info!("experiment complete");
        Ok(())
    }

    fn connect(&self, experiment: &Experiment) -> Vec<Box<dyn RemoteTarget>> {
        experiment
            .targets()
            .iter()
            .enumerate()
            .map(|(index, server)| match self.transport.connect(server, index) {
                Ok(target) => target,
                Err(err) => {
                    tracing::warn!(target_node = %server.name, error = %err, "connect failed");
                    Box::new(UnreachableTarget::new(
                        TargetInfo::from_server(server, index),
                        err.info().message.clone(),
                    )) as Box<dyn RemoteTarget>
                }
            })
            .collect()
    }

    fn run_instance(
        &self,
        experiment: &Experiment,
        index: usize,
        binding: ParameterBinding,
    ) -> Result<InstanceReport, DxError> {
        let options = experiment.options();
        let max_attempts = options.max_attempts.or(self.opts.max_attempts);
        let command_timeout = options.command_timeout.or(self.opts.command_timeout);
        let mut report = InstanceReport {
            index,
            instance_id: instance_id(experiment.name(), &binding)?,
            binding,
            attempts: 0,
            state: InstanceState::Complete,
            started_at: timestamp(),
            finished_at: String::new(),
            commands: Vec::new(),
            error: None,
        };
        let mut targets = self.connect(experiment);
        loop {
            report.attempts += 1;
            let attempt = report.attempts;
            tracing::info!(index, attempt, binding = %report.binding, "running instance");
            let log = Arc::new(CommandLog::default());
            let mut fanout = CommandFanout::new()
                .with_timeout(command_timeout)
                .with_log(Arc::clone(&log));
            let latch = options.raise_on_rc.then(|| Arc::new(FailureLatch::default()));
            if let Some(latch) = &latch {
                fanout = fanout.with_latch(Arc::clone(latch));
            }
            let outcome = {
                let mut ctx = ExperimentContext::new(
                    experiment.name(),
                    index,
                    attempt,
                    &report.binding,
                    &mut targets,
                    fanout,
                );
                experiment.invoke(&mut ctx)
            };
            report.commands = log.take();
            let tripped = latch.as_ref().and_then(|latch| latch.first_failure());
            let fatal = match (tripped, outcome) {
                (Some(failure), _) => Some(nonzero_exit(&failure)),
                (None, Err(err)) => Some(err.info().clone()),
                (None, Ok(ControlSignal::Done)) => None,
                (None, Ok(ControlSignal::Abort(reason))) => {
                    Some(ErrorInfo::new("dispatch.abort", "experiment requested abort").with_hint(reason))
                }
                (None, Ok(ControlSignal::Restart)) => match max_attempts {
                    Some(max) if attempt >= max => Some(
                        ErrorInfo::new("dispatch.retries_exhausted", "instance kept requesting restart")
                            .with_context("max_attempts", max.to_string()),
                    ),
                    _ => {
                        tracing::warn!(index, attempt, binding = %report.binding, "restart requested");
                        if !self.opts.backoff.is_zero() {
                            thread::sleep(self.opts.backoff);
                        }
                        continue;
                    }
                },
            };
            report.finished_at = timestamp();
            if let Some(info) = fatal {
                report.state = InstanceState::Failed;
                report.error = Some(
                    info.with_context("experiment", experiment.name())
                        .with_context("binding", report.binding.to_string())
                        .with_context("attempt", attempt.to_string()),
                );
            }
            return Ok(report);
        }
    }
}

fn empty_section(experiment: &Experiment) -> ExperimentReport {
    ExperimentReport {
        name: experiment.name().to_string(),
        shape: experiment.shape(),
        targets: experiment
            .targets()
            .iter()
            .map(|server| server.name.clone())
            .collect(),
        instances: Vec::new(),
    }
}
