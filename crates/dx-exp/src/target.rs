//! Contracts for reaching cluster nodes.
//!
//! The engine never talks to a node directly. A [`Transport`] turns a
//! [`ServerSpec`] into a [`RemoteTarget`], the target launches commands, and
//! each launch yields a [`CommandHandle`] that is waited on explicitly.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::time::Instant;

use dx_core::errors::{DxError, ErrorInfo};
use serde::{Deserialize, Serialize};

use crate::cluster::ServerSpec;

/// Identity of a connected target, handed to command builders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub name: String,
    pub host: String,
    /// Position of the target within its experiment's target list.
    pub index: usize,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl TargetInfo {
    pub fn from_server(server: &ServerSpec, index: usize) -> Self {
        Self {
            name: server.name.clone(),
            host: server.host.clone(),
            index,
            meta: server.meta.clone(),
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

/// Terminal state of one launched command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum CommandStatus {
    /// The process ran and exited with this code.
    Exited(i32),
    /// The command never started (unreachable node, spawn failure).
    LaunchFailed(String),
    /// The per-command deadline passed; the process was killed.
    TimedOut,
}

impl CommandStatus {
    pub fn success(&self) -> bool {
        matches!(self, CommandStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            CommandStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Exited(code) => write!(f, "exit {code}"),
            CommandStatus::LaunchFailed(reason) => write!(f, "launch failed: {reason}"),
            CommandStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// A launched command on one target.
pub trait CommandHandle: Send {
    /// Blocks until the command terminates.
    fn wait(&mut self) -> CommandStatus;

    /// Blocks until the command terminates or `deadline` passes.
    /// Returns `None` while the command is still running.
    fn wait_until(&mut self, deadline: Instant) -> Option<CommandStatus>;

    /// Best-effort termination of a still running command.
    fn kill(&mut self);

    /// Captured standard output, available once the command has terminated.
    fn take_output(&mut self) -> Option<String> {
        None
    }
}

/// One cluster node capable of running shell commands.
pub trait RemoteTarget: Send {
    fn info(&self) -> &TargetInfo;

    /// Sets the working directory for subsequently launched commands.
    fn cd(&mut self, path: &str);

    fn cwd(&self) -> Option<&str>;

    /// Launches `command` without waiting for it.
    fn run_cmd(&mut self, command: &str) -> Result<Box<dyn CommandHandle>, DxError>;
}

/// Opens targets for the servers of an experiment.
pub trait Transport: Send + Sync {
    fn connect(&self, server: &ServerSpec, index: usize) -> Result<Box<dyn RemoteTarget>, DxError>;
}

/// Stand-in for a node whose connection could not be opened.
///
/// Every launch fails, so the failure reaches the experiment body as a
/// [`CommandStatus::LaunchFailed`] result instead of an error.
#[derive(Debug)]
pub struct UnreachableTarget {
    info: TargetInfo,
    cwd: Option<String>,
    reason: String,
}

impl UnreachableTarget {
    pub fn new(info: TargetInfo, reason: impl Into<String>) -> Self {
        Self {
            info,
            cwd: None,
            reason: reason.into(),
        }
    }
}

impl RemoteTarget for UnreachableTarget {
    fn info(&self) -> &TargetInfo {
        &self.info
    }

    fn cd(&mut self, path: &str) {
        self.cwd = Some(path.to_string());
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn run_cmd(&mut self, _command: &str) -> Result<Box<dyn CommandHandle>, DxError> {
        Err(DxError::Remote(
            ErrorInfo::new("remote.unreachable", self.reason.clone())
                .with_context("target", self.info.name.clone()),
        ))
    }
}
