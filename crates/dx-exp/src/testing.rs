//! In-memory transport for exercising experiments without processes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dx_core::errors::{DxError, ErrorInfo};

use crate::cluster::ServerSpec;
use crate::target::{CommandHandle, CommandStatus, RemoteTarget, TargetInfo, Transport};

/// How a mock target reacts to connects and launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Every command exits with this code immediately.
    Exit(i32),
    /// The n-th launch on this target exits with the n-th code; the last repeats.
    ExitSequence(Vec<i32>),
    /// `run_cmd` fails with this reason.
    FailLaunch(String),
    /// Commands exit with the code after the delay.
    Delay(Duration, i32),
    /// `connect` fails with this reason.
    Unreachable(String),
}

/// One recorded launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub target: String,
    pub command: String,
    pub cwd: Option<String>,
}

/// Transport whose targets follow scripted [`MockBehavior`]s and log every launch.
#[derive(Debug, Clone)]
pub struct MockTransport {
    default: MockBehavior,
    behaviors: BTreeMap<String, MockBehavior>,
    launches: Arc<Mutex<Vec<Launch>>>,
    connects: Arc<AtomicUsize>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            default: MockBehavior::Exit(0),
            behaviors: BTreeMap::new(),
            launches: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for targets without their own entry.
    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn with_behavior(mut self, target: impl Into<String>, behavior: MockBehavior) -> Self {
        self.behaviors.insert(target.into(), behavior);
        self
    }

    /// Every launch attempted so far, in order, including failed ones.
    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().map(|log| log.len()).unwrap_or_default()
    }

    /// Number of successful and failed connects.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn behavior(&self, target: &str) -> MockBehavior {
        self.behaviors.get(target).unwrap_or(&self.default).clone()
    }
}

impl Transport for MockTransport {
    fn connect(&self, server: &ServerSpec, index: usize) -> Result<Box<dyn RemoteTarget>, DxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior(&server.name);
        if let MockBehavior::Unreachable(reason) = &behavior {
            return Err(DxError::Remote(
                ErrorInfo::new("remote.connect", reason.clone()).with_context("target", server.name.clone()),
            ));
        }
        Ok(Box::new(MockTarget {
            info: TargetInfo::from_server(server, index),
            cwd: None,
            behavior,
            launches: Arc::clone(&self.launches),
        }))
    }
}

struct MockTarget {
    info: TargetInfo,
    cwd: Option<String>,
    behavior: MockBehavior,
    launches: Arc<Mutex<Vec<Launch>>>,
}

impl MockTarget {
    /// Records the launch and returns how many earlier launches this target saw.
    fn record(&self, command: &str) -> usize {
        let Ok(mut log) = self.launches.lock() else {
            return 0;
        };
        let previous = log.iter().filter(|launch| launch.target == self.info.name).count();
        log.push(Launch {
            target: self.info.name.clone(),
            command: command.to_string(),
            cwd: self.cwd.clone(),
        });
        previous
    }
}

impl RemoteTarget for MockTarget {
    fn info(&self) -> &TargetInfo {
        &self.info
    }

    fn cd(&mut self, path: &str) {
        self.cwd = Some(path.to_string());
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn run_cmd(&mut self, command: &str) -> Result<Box<dyn CommandHandle>, DxError> {
        let previous = self.record(command);
        let now = Instant::now();
        let (code, ready_at) = match &self.behavior {
            MockBehavior::Exit(code) => (*code, now),
            MockBehavior::ExitSequence(codes) => {
                let code = codes.get(previous).or(codes.last()).copied().unwrap_or(0);
                (code, now)
            }
            MockBehavior::Delay(delay, code) => (*code, now + *delay),
            MockBehavior::FailLaunch(reason) | MockBehavior::Unreachable(reason) => {
                return Err(DxError::Remote(
                    ErrorInfo::new("remote.launch", reason.clone())
                        .with_context("target", self.info.name.clone()),
                ))
            }
        };
        Ok(Box::new(MockHandle {
            status: CommandStatus::Exited(code),
            ready_at,
            killed: false,
        }))
    }
}

struct MockHandle {
    status: CommandStatus,
    ready_at: Instant,
    killed: bool,
}

impl CommandHandle for MockHandle {
    fn wait(&mut self) -> CommandStatus {
        if !self.killed {
            thread::sleep(self.ready_at.saturating_duration_since(Instant::now()));
        }
        self.status.clone()
    }

    fn wait_until(&mut self, deadline: Instant) -> Option<CommandStatus> {
        if self.ready_at <= deadline {
            return Some(self.wait());
        }
        thread::sleep(deadline.saturating_duration_since(Instant::now()));
        None
    }

    fn kill(&mut self) {
        self.killed = true;
        self.status = CommandStatus::Exited(137);
    }
}
