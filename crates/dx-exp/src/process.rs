//! Process-backed transports: local `sh -c` and one `ssh` process per command.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dx_core::errors::{DxError, ErrorInfo};

use crate::cluster::{ServerSpec, TransportKind};
use crate::target::{CommandHandle, CommandStatus, RemoteTarget, TargetInfo, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to keep draining stdout after the shell itself has exited.
/// Background jobs may hold the pipe open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(200);

/// Captured stdout, filled by a reader thread until the pipe closes.
#[derive(Debug)]
struct OutputPipe {
    buf: Arc<Mutex<Vec<u8>>>,
    closed: Receiver<()>,
}

impl OutputPipe {
    fn start(mut stdout: impl Read + Send + 'static) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, closed) = mpsc::channel();
        let sink = Arc::clone(&buf);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match stdout.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut out) => out.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                }
            }
            let _ = tx.send(());
        });
        Self { buf, closed }
    }

    /// Waits up to `grace` for the pipe to close, then returns what was read.
    fn collect(self, grace: Duration) -> String {
        if self.closed.recv_timeout(grace).is_err() {
            tracing::debug!("stdout still open after exit; keeping partial output");
        }
        let bytes = self.buf.lock().map(|out| out.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Handle over a spawned child process.
///
/// On unix the child leads its own process group, so a kill reaches every
/// process the command started.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pipe: Option<OutputPipe>,
    output: Option<String>,
    finished: Option<CommandStatus>,
}

impl ProcessHandle {
    fn spawn(mut command: Command, capture: bool) -> Result<Self, std::io::Error> {
        command.stdin(Stdio::null());
        if capture {
            command.stdout(Stdio::piped());
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command.spawn()?;
        // Drain stdout on a side thread so a chatty process never blocks on a full pipe.
        let pipe = child.stdout.take().map(OutputPipe::start);
        Ok(Self {
            child,
            pipe,
            output: None,
            finished: None,
        })
    }

    fn finish(&mut self, status: CommandStatus, grace: Duration) -> CommandStatus {
        if let Some(pipe) = self.pipe.take() {
            self.output = Some(pipe.collect(grace));
        }
        self.finished = Some(status.clone());
        status
    }

    fn kill_group(&mut self) {
        #[cfg(unix)]
        {
            if let Ok(pgid) = libc::pid_t::try_from(self.child.id()) {
                unsafe {
                    libc::killpg(pgid, libc::SIGKILL);
                }
            }
        }
        let _ = self.child.kill();
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

impl CommandHandle for ProcessHandle {
    fn wait(&mut self) -> CommandStatus {
        if let Some(status) = &self.finished {
            return status.clone();
        }
        let status = match self.child.wait() {
            Ok(status) => CommandStatus::Exited(exit_code(status)),
            Err(err) => CommandStatus::LaunchFailed(format!("wait failed: {err}")),
        };
        self.finish(status, DRAIN_GRACE)
    }

    fn wait_until(&mut self, deadline: Instant) -> Option<CommandStatus> {
        if let Some(status) = &self.finished {
            return Some(status.clone());
        }
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    return Some(self.finish(CommandStatus::Exited(exit_code(status)), DRAIN_GRACE))
                }
                Ok(None) if Instant::now() >= deadline => return None,
                Ok(None) => thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))),
                Err(err) => {
                    return Some(self.finish(
                        CommandStatus::LaunchFailed(format!("wait failed: {err}")),
                        DRAIN_GRACE,
                    ))
                }
            }
        }
    }

    fn kill(&mut self) {
        if self.finished.is_some() {
            return;
        }
        self.kill_group();
        let _ = self.child.wait();
        self.finish(CommandStatus::TimedOut, DRAIN_AFTER_KILL);
    }

    fn take_output(&mut self) -> Option<String> {
        self.output.take()
    }
}

fn spawn_error(target: &TargetInfo, command: &str, err: std::io::Error) -> DxError {
    DxError::Remote(
        ErrorInfo::new("remote.spawn", err.to_string())
            .with_context("target", target.name.clone())
            .with_context("command", command),
    )
}

/// Runs commands on this machine through `sh -c`.
#[derive(Debug)]
pub struct LocalTarget {
    info: TargetInfo,
    cwd: Option<String>,
    capture: bool,
}

impl LocalTarget {
    pub fn new(info: TargetInfo, capture: bool) -> Self {
        Self {
            info,
            cwd: None,
            capture,
        }
    }
}

impl RemoteTarget for LocalTarget {
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
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        let handle = ProcessHandle::spawn(cmd, self.capture)
            .map_err(|err| spawn_error(&self.info, command, err))?;
        Ok(Box::new(handle))
    }
}

/// Quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs each command through its own `ssh` invocation.
#[derive(Debug)]
pub struct SshTarget {
    info: TargetInfo,
    server: ServerSpec,
    cwd: Option<String>,
    capture: bool,
}

impl SshTarget {
    pub fn new(server: ServerSpec, index: usize, capture: bool) -> Self {
        Self {
            info: TargetInfo::from_server(&server, index),
            server,
            cwd: None,
            capture,
        }
    }

    /// Full argument vector for `ssh`, with the remote command last.
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.server.ssh_base_args();
        let remote = match &self.cwd {
            Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
            None => command.to_string(),
        };
        args.push(remote);
        args
    }
}

impl RemoteTarget for SshTarget {
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
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(command));
        let handle = ProcessHandle::spawn(cmd, self.capture)
            .map_err(|err| spawn_error(&self.info, command, err))?;
        Ok(Box::new(handle))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport {
    pub capture_output: bool,
}

impl Transport for LocalTransport {
    fn connect(&self, server: &ServerSpec, index: usize) -> Result<Box<dyn RemoteTarget>, DxError> {
        Ok(Box::new(LocalTarget::new(
            TargetInfo::from_server(server, index),
            self.capture_output,
        )))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport {
    pub capture_output: bool,
}

impl Transport for SshTransport {
    fn connect(&self, server: &ServerSpec, index: usize) -> Result<Box<dyn RemoteTarget>, DxError> {
        Ok(Box::new(SshTarget::new(
            server.clone(),
            index,
            self.capture_output,
        )))
    }
}

/// Builds the transport named by a cluster config.
pub fn transport_for(kind: TransportKind, capture_output: bool) -> Box<dyn Transport> {
    match kind {
        TransportKind::Ssh => Box::new(SshTransport { capture_output }),
        TransportKind::Local => Box::new(LocalTransport { capture_output }),
    }
}
