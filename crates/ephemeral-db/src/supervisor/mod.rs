//! Supervision of the long-running database server process.
//!
//! The server runs in its own process group with stdin closed and stdout and
//! stderr piped back to the supervisor. The pipes are non-blocking and are
//! drained whenever the supervisor polls the process, keeping the most
//! recent output of each stream for diagnostics.

use std::fmt;
use std::io::{self, ErrorKind, Read};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdout, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bootstrap::run_captured;
use crate::command::{CommandSpec, Invoker};
use crate::connection::ConnectionError;
use crate::engine::ShutdownPlan;

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::process");

/// Bytes retained per output stream.
const CAPTURE_LIMIT: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Time an aborted server gets to exit after `SIGINT` before `SIGKILL`.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Output captured from the server process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessDiagnostics {
    /// Most recent standard output.
    pub stdout: String,
    /// Most recent standard error.
    pub stderr: String,
}

impl fmt::Display for ProcessDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OUT: {}\nERR: {}", self.stdout, self.stderr)
    }
}

/// Errors raised while starting the server or waiting for it to accept
/// connections.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The server command could not be executed.
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The server exited before it became ready.
    #[error("database server exited before becoming ready ({status})\n{diagnostics}")]
    Exited {
        /// Exit status description.
        status: String,
        /// Output captured from the server.
        diagnostics: ProcessDiagnostics,
    },
    /// The server never accepted connections within the retry budget.
    #[error("database server not ready after {attempts} attempts: {source}\n{diagnostics}")]
    Readiness {
        /// Attempts made in the failing phase.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: ConnectionError,
        /// Output captured from the server.
        diagnostics: ProcessDiagnostics,
    },
    /// The server process could not be polled.
    #[error("failed to monitor database server: {source}\n{diagnostics}")]
    Monitor {
        /// Underlying IO error.
        #[source]
        source: io::Error,
        /// Output captured from the server.
        diagnostics: ProcessDiagnostics,
    },
}

/// Errors raised while stopping the server.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// The shutdown signal could not be delivered.
    #[error("failed to send {signal:?} to database server (pid {pid}): {source}")]
    Signal {
        /// Server process id.
        pid: u32,
        /// Signal that was sent.
        signal: Signal,
        /// Underlying errno.
        #[source]
        source: Errno,
    },
    /// The administrative shutdown command could not be executed.
    #[error("failed to run {program}: {source}")]
    AdminSpawn {
        /// Administrative program.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The administrative shutdown command reported failure.
    #[error("failed to shut down database: {program} {status} -> {output}")]
    AdminFailed {
        /// Administrative program.
        program: String,
        /// Exit status description.
        status: String,
        /// Combined stdout and stderr.
        output: String,
    },
    /// Waiting for the server to exit failed.
    #[error("failed to wait for database server: {source}")]
    Wait {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The server exited unsuccessfully.
    #[error("database server exited uncleanly ({status})\n{diagnostics}")]
    Exited {
        /// Exit status description.
        status: String,
        /// Output captured from the server.
        diagnostics: ProcessDiagnostics,
    },
}

/// Reason a server that should be running is not.
#[derive(Debug)]
pub enum ProcessFault {
    /// The process exited.
    Exited(ExitStatus),
    /// The process could not be polled.
    Monitor(io::Error),
}

/// Handle to a spawned server process.
///
/// Dropping a handle whose process is still running kills the whole process
/// group and reaps the leader.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    pid: Pid,
    program: String,
    stdout: Capture<ChildStdout>,
    stderr: Capture<ChildStderr>,
    status: Option<ExitStatus>,
}

impl ServerProcess {
    /// Spawns `spec` as the invoker's identity in a new process group.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Spawn`] when the command cannot be executed.
    pub fn spawn(spec: &CommandSpec, invoker: &Invoker<'_>) -> Result<Self, StartupError> {
        let program = spec.display_name();
        let mut command = invoker.command(spec);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut child = command.spawn().map_err(|source| StartupError::Spawn {
            program: program.clone(),
            source,
        })?;
        #[expect(
            clippy::cast_possible_wrap,
            reason = "process ids always fit in pid_t"
        )]
        let pid = Pid::from_raw(child.id() as i32);
        let stdout = Capture::new(child.stdout.take());
        let stderr = Capture::new(child.stderr.take());
        info!(
            target: PROCESS_TARGET,
            pid = child.id(),
            program = %program,
            "database server spawned"
        );
        Ok(Self {
            child,
            pid,
            program,
            stdout,
            stderr,
            status: None,
        })
    }

    /// Process id of the server (or of its identity-switching wrapper).
    #[must_use]
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Drains whatever output the server has written since the last call.
    pub fn pump(&mut self) {
        self.stdout.pump();
        self.stderr.pump();
    }

    /// Copy of the output captured so far.
    #[must_use]
    pub fn diagnostics(&self) -> ProcessDiagnostics {
        ProcessDiagnostics {
            stdout: self.stdout.text(),
            stderr: self.stderr.text(),
        }
    }

    /// Checks that the server has not exited, draining its output.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessFault::Exited`] once the process has exited and
    /// [`ProcessFault::Monitor`] when it cannot be polled.
    pub fn ensure_running(&mut self) -> Result<(), ProcessFault> {
        self.pump();
        if let Some(status) = self.status {
            return Err(ProcessFault::Exited(status));
        }
        match self.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                self.record_exit(status);
                Err(ProcessFault::Exited(status))
            }
            Err(error) => Err(ProcessFault::Monitor(error)),
        }
    }

    /// Stops the server according to `plan` and waits for it to exit.
    ///
    /// Signals go to the server process alone. Administrative commands run
    /// as the caller. A server that already exited is not asked again; its
    /// recorded status decides the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] when the request cannot be delivered, the
    /// process cannot be waited on, or it exits unsuccessfully. The process
    /// may still be running after a delivery failure; [`Self::abort`] or
    /// dropping the handle terminates it.
    pub fn shutdown(
        &mut self,
        plan: &ShutdownPlan,
        invoker: &Invoker<'_>,
    ) -> Result<ExitStatus, ShutdownError> {
        if self.status.is_none() {
            self.request_stop(plan, invoker)?;
        }
        let status = match self.status {
            Some(status) => status,
            None => self
                .wait_pumping()
                .map_err(|source| ShutdownError::Wait { source })?,
        };
        if status.success() {
            info!(target: PROCESS_TARGET, pid = self.id(), %status, "database server stopped");
            Ok(status)
        } else {
            Err(ShutdownError::Exited {
                status: status.to_string(),
                diagnostics: self.diagnostics(),
            })
        }
    }

    /// Interrupts the server process group and collects its output.
    ///
    /// Sends `SIGINT` to the group, escalating to `SIGKILL` when the server
    /// has not exited within a short grace period.
    pub fn abort(mut self) -> ProcessDiagnostics {
        if self.status.is_none() {
            info!(target: PROCESS_TARGET, pid = self.id(), program = %self.program, "aborting database server");
            self.signal_group(Signal::SIGINT);
            let exited = matches!(self.wait_until(Instant::now() + ABORT_GRACE), Ok(Some(_)));
            if !exited {
                warn!(
                    target: PROCESS_TARGET,
                    pid = self.id(),
                    "database server ignored SIGINT; killing process group"
                );
                self.kill_and_reap();
            }
        }
        self.pump();
        ProcessDiagnostics {
            stdout: self.stdout.take_text(),
            stderr: self.stderr.take_text(),
        }
    }

    fn request_stop(&mut self, plan: &ShutdownPlan, invoker: &Invoker<'_>) -> Result<(), ShutdownError> {
        match plan {
            ShutdownPlan::Signal(signal) => {
                debug!(target: PROCESS_TARGET, pid = self.id(), ?signal, "signalling database server");
                kill(self.pid, *signal).map_err(|source| ShutdownError::Signal {
                    pid: self.id(),
                    signal: *signal,
                    source,
                })
            }
            ShutdownPlan::AdminCommand(spec) => {
                let program = spec.display_name();
                debug!(target: PROCESS_TARGET, program = %program, "running shutdown command");
                let output = run_captured(invoker.caller_command(spec)).map_err(|source| {
                    ShutdownError::AdminSpawn {
                        program: program.clone(),
                        source,
                    }
                })?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(ShutdownError::AdminFailed {
                        program,
                        status: output.status.to_string(),
                        output: output.combined,
                    })
                }
            }
        }
    }

    fn wait_pumping(&mut self) -> io::Result<ExitStatus> {
        loop {
            self.pump();
            if let Some(status) = self.child.try_wait()? {
                self.record_exit(status);
                return Ok(status);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn wait_until(&mut self, deadline: Instant) -> io::Result<Option<ExitStatus>> {
        loop {
            self.pump();
            if let Some(status) = self.child.try_wait()? {
                self.record_exit(status);
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn kill_and_reap(&mut self) {
        self.signal_group(Signal::SIGKILL);
        match self.child.wait() {
            Ok(status) => self.record_exit(status),
            Err(error) => warn!(
                target: PROCESS_TARGET,
                pid = self.id(),
                %error,
                "failed to reap database server"
            ),
        }
    }

    fn signal_group(&self, signal: Signal) {
        match killpg(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => warn!(
                target: PROCESS_TARGET,
                pgid = self.pid.as_raw(),
                ?signal,
                %error,
                "failed to signal database server process group"
            ),
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        if self.status.is_none() {
            debug!(target: PROCESS_TARGET, pid = self.id(), %status, "database server exited");
        }
        self.status = Some(status);
        self.pump();
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.status.is_some() || matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        warn!(
            target: PROCESS_TARGET,
            pid = self.id(),
            program = %self.program,
            "database server still running on drop; killing process group"
        );
        self.kill_and_reap();
    }
}

/// Bounded, non-blocking capture of one output stream.
#[derive(Debug)]
struct Capture<R> {
    pipe: Option<R>,
    buffer: Vec<u8>,
}

impl<R: Read + AsRawFd> Capture<R> {
    fn new(source: Option<R>) -> Self {
        let pipe = source.and_then(|stream| match set_nonblocking(stream.as_raw_fd()) {
            Ok(()) => Some(stream),
            Err(error) => {
                warn!(
                    target: PROCESS_TARGET,
                    %error,
                    "cannot make server output non-blocking; discarding it"
                );
                None
            }
        });
        Self {
            pipe,
            buffer: Vec::new(),
        }
    }

    fn pump(&mut self) {
        let Some(stream) = self.pipe.as_mut() else {
            return;
        };
        let mut chunk = [0_u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.pipe = None;
                    return;
                }
                Ok(read) => append_bounded(&mut self.buffer, chunk.get(..read).unwrap_or_default()),
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                Err(error) => {
                    debug!(target: PROCESS_TARGET, %error, "server output stream failed");
                    self.pipe = None;
                    return;
                }
            }
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    fn take_text(&mut self) -> String {
        String::from_utf8_lossy(&mem::take(&mut self.buffer)).into_owned()
    }
}

fn append_bounded(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(bytes);
    let excess = buffer.len().saturating_sub(CAPTURE_LIMIT);
    if excess > 0 {
        buffer.drain(..excess);
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
