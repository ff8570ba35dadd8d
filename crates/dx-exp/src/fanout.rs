//! Concurrent dispatch of one command per target with explicit per-target waits.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::target::{CommandHandle, CommandStatus, RemoteTarget, TargetInfo};

/// Outcome of one command on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub target: String,
    pub command: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Records the first unsuccessful command seen by the fan-outs it is attached to.
#[derive(Debug, Default)]
pub struct FailureLatch {
    first: Mutex<Option<CommandResult>>,
}

impl FailureLatch {
    fn record(&self, result: &CommandResult) {
        if let Ok(mut slot) = self.first.lock() {
            if slot.is_none() {
                *slot = Some(result.clone());
            }
        }
    }

    pub fn first_failure(&self) -> Option<CommandResult> {
        self.first.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Every finished command of the fan-outs it is attached to, in completion order.
#[derive(Debug, Default)]
pub struct CommandLog {
    entries: Mutex<Vec<CommandResult>>,
}

impl CommandLog {
    fn record(&self, result: &CommandResult) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(result.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the recorded results.
    pub fn take(&self) -> Vec<CommandResult> {
        self.entries
            .lock()
            .map(|mut entries| std::mem::take(&mut *entries))
            .unwrap_or_default()
    }
}

enum PendingState {
    Running(Box<dyn CommandHandle>),
    Finished(CommandStatus, Option<String>),
}

/// A command launched on one target, not yet necessarily finished.
pub struct PendingCommand {
    target: String,
    command: String,
    deadline: Option<Instant>,
    latch: Option<Arc<FailureLatch>>,
    log: Option<Arc<CommandLog>>,
    state: PendingState,
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("target", &self.target)
            .field("command", &self.command)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl PendingCommand {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, PendingState::Finished(..))
    }

    /// Blocks until this target's command terminates and returns its status.
    ///
    /// Calling `wait` again returns the cached status. When the fan-out was
    /// launched with a timeout, a command still running at the deadline is
    /// killed and reported as [`CommandStatus::TimedOut`].
    pub fn wait(&mut self) -> CommandStatus {
        let (status, output) = match &mut self.state {
            PendingState::Finished(status, _) => return status.clone(),
            PendingState::Running(handle) => {
                let status = match self.deadline {
                    None => handle.wait(),
                    Some(deadline) => match handle.wait_until(deadline) {
                        Some(status) => status,
                        None => {
                            handle.kill();
                            CommandStatus::TimedOut
                        }
                    },
                };
                (status, handle.take_output())
            }
        };
        tracing::debug!(target_node = %self.target, status = %status, "command finished");
        self.state = PendingState::Finished(status.clone(), output);
        self.settle();
        status
    }

    fn settle(&self) {
        if self.latch.is_none() && self.log.is_none() {
            return;
        }
        let result = self.snapshot();
        if let Some(log) = &self.log {
            log.record(&result);
        }
        if let (Some(latch), false) = (&self.latch, result.success()) {
            latch.record(&result);
        }
    }

    fn snapshot(&self) -> CommandResult {
        let (status, output) = match &self.state {
            PendingState::Finished(status, output) => (status.clone(), output.clone()),
            PendingState::Running(_) => (CommandStatus::LaunchFailed("still running".into()), None),
        };
        CommandResult {
            target: self.target.clone(),
            command: self.command.clone(),
            status,
            output,
        }
    }

    /// Waits and converts into an owned result.
    pub fn into_result(mut self) -> CommandResult {
        self.wait();
        self.snapshot()
    }
}

/// All commands of one fan-out, in target order.
#[derive(Debug)]
pub struct Fanout {
    commands: Vec<PendingCommand>,
}

impl Fanout {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[PendingCommand] {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut [PendingCommand] {
        &mut self.commands
    }

    /// Waits on every command; completion order does not matter.
    pub fn wait_all(self) -> FanoutResult {
        FanoutResult {
            results: self
                .commands
                .into_iter()
                .map(PendingCommand::into_result)
                .collect(),
        }
    }
}

impl IntoIterator for Fanout {
    type Item = PendingCommand;
    type IntoIter = std::vec::IntoIter<PendingCommand>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

/// Per-target results of a completed fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutResult {
    pub results: Vec<CommandResult>,
}

impl FanoutResult {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(CommandResult::success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CommandResult> {
        self.results.iter().filter(|result| !result.success())
    }

    /// Exit codes in target order; `None` where the command never exited.
    pub fn exit_codes(&self) -> Vec<Option<i32>> {
        self.results.iter().map(|result| result.status.code()).collect()
    }
}

/// Launches one command per target.
#[derive(Debug, Clone, Default)]
pub struct CommandFanout {
    timeout: Option<Duration>,
    latch: Option<Arc<FailureLatch>>,
    log: Option<Arc<CommandLog>>,
}

impl CommandFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-command deadline measured from launch.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Once `latch` has recorded a failure, later launches are refused.
    pub fn with_latch(mut self, latch: Arc<FailureLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    pub fn latch(&self) -> Option<&Arc<FailureLatch>> {
        self.latch.as_ref()
    }

    pub fn with_log(mut self, log: Arc<CommandLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Builds a command for every target from its identity and launches them in
    /// target order without waiting. A launch failure becomes a finished
    /// command with [`CommandStatus::LaunchFailed`]; so does every command
    /// refused because the attached latch has tripped.
    pub fn run_on_all<F>(&self, targets: &mut [Box<dyn RemoteTarget>], mut builder: F) -> Fanout
    where
        F: FnMut(&TargetInfo) -> String,
    {
        let mut commands = Vec::with_capacity(targets.len());
        for target in targets.iter_mut() {
            let info = target.info().clone();
            let command = builder(&info);
            tracing::debug!(target_node = %info.name, cwd = ?target.cwd(), %command, "launching");
            let tripped = self.latch.as_ref().and_then(|latch| latch.first_failure());
            let state = match tripped {
                Some(failure) => {
                    tracing::debug!(target_node = %info.name, %command, "launch refused after failure");
                    PendingState::Finished(
                        CommandStatus::LaunchFailed(format!(
                            "not launched: {} failed earlier ({})",
                            failure.target, failure.status
                        )),
                        None,
                    )
                }
                None => match target.run_cmd(&command) {
                    Ok(handle) => PendingState::Running(handle),
                    Err(err) => {
                        tracing::warn!(target_node = %info.name, error = %err, "launch failed");
                        PendingState::Finished(CommandStatus::LaunchFailed(err.info().message.clone()), None)
                    }
                },
            };
            let pending = PendingCommand {
                target: info.name,
                command,
                deadline: self.timeout.map(|timeout| Instant::now() + timeout),
                latch: self.latch.clone(),
                log: self.log.clone(),
                state,
            };
            if pending.is_finished() {
                pending.settle();
            }
            commands.push(pending);
        }
        Fanout { commands }
    }
}
