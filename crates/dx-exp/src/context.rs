use dx_core::errors::{DxError, ErrorInfo};

use crate::fanout::{CommandFanout, CommandResult, Fanout, FanoutResult};
use crate::grid::ParameterBinding;
use crate::target::{RemoteTarget, TargetInfo};

/// Everything an experiment body sees while one instance runs.
///
/// The targets are exclusively borrowed for the duration of the instance.
pub struct ExperimentContext<'a> {
    experiment: &'a str,
    index: usize,
    attempt: u32,
    binding: &'a ParameterBinding,
    targets: &'a mut [Box<dyn RemoteTarget>],
    fanout: CommandFanout,
}

/// The error raised when a command fails while `raise_on_rc` is set.
pub(crate) fn nonzero_exit(failure: &CommandResult) -> ErrorInfo {
    ErrorInfo::new("dispatch.nonzero_exit", "command failed with raise_on_rc set")
        .with_context("target", failure.target.clone())
        .with_context("command", failure.command.clone())
        .with_context("status", failure.status.to_string())
}

impl<'a> ExperimentContext<'a> {
    pub(crate) fn new(
        experiment: &'a str,
        index: usize,
        attempt: u32,
        binding: &'a ParameterBinding,
        targets: &'a mut [Box<dyn RemoteTarget>],
        fanout: CommandFanout,
    ) -> Self {
        Self {
            experiment,
            index,
            attempt,
            binding,
            targets,
            fanout,
        }
    }

    pub fn experiment(&self) -> &str {
        self.experiment
    }

    /// Row-major position of the current binding.
    pub fn index(&self) -> usize {
        self.index
    }

    /// 1-based attempt counter for the current binding.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn binding(&self) -> &ParameterBinding {
        self.binding
    }

    /// Whether any unsuccessful command fails the run.
    pub fn raise_on_rc(&self) -> bool {
        self.fanout.latch().is_some()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn target_infos(&self) -> Vec<TargetInfo> {
        self.targets.iter().map(|target| target.info().clone()).collect()
    }

    pub fn targets_mut(&mut self) -> &mut [Box<dyn RemoteTarget>] {
        &mut *self.targets
    }

    /// Changes the working directory on every target.
    pub fn cd(&mut self, path: &str) {
        for target in self.targets.iter_mut() {
            target.cd(path);
        }
    }

    /// Launches one command per target without waiting.
    ///
    /// With `raise_on_rc` set, nothing is launched once a command of this
    /// instance has failed; every target reports `LaunchFailed` instead.
    pub fn run_on_all<F>(&mut self, builder: F) -> Fanout
    where
        F: FnMut(&TargetInfo) -> String,
    {
        self.fanout.run_on_all(&mut *self.targets, builder)
    }

    /// Launches and waits for one command per target.
    ///
    /// With `raise_on_rc` set, any unsuccessful target turns into an error so
    /// the body can bail out with `?`.
    pub fn run_and_wait<F>(&mut self, builder: F) -> Result<FanoutResult, DxError>
    where
        F: FnMut(&TargetInfo) -> String,
    {
        let result = self.run_on_all(builder).wait_all();
        self.check_exits(&result)?;
        Ok(result)
    }

    /// Turns the first failure of `result` into an error when `raise_on_rc` is set.
    pub fn check_exits(&self, result: &FanoutResult) -> Result<(), DxError> {
        match result.failures().next() {
            Some(failure) if self.raise_on_rc() => Err(DxError::Dispatch(nonzero_exit(failure))),
            _ => Ok(()),
        }
    }

    /// Runs the same command on every target and waits for all of them.
    pub fn run_everywhere(&mut self, command: &str) -> Result<FanoutResult, DxError> {
        self.run_and_wait(|_| command.to_string())
    }
}
