//! Uniform contract for running commands on, and moving files to and from,
//! the machine under construction.
//!
//! A [`Communicator`] launches a [`RemoteCmd`] and returns as soon as the
//! process is running; the command's completion is delivered through the
//! command itself and observed with [`RemoteCmd::wait`]. A non-zero exit is
//! not an error at this layer. A dropped transport is reported as
//! [`ExitStatus::Disconnected`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use camino::Utf8Path;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ui::Ui;

mod config;
mod local;
mod ssh;

pub use config::{SshConfig, SshConfigLoadError, expand_tilde};
pub use local::LocalCommunicator;
pub use ssh::{SshCommunicator, SshTarget};

/// Exit status of a [`RemoteCmd`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// The command has not been started, or its completion was not awaited.
    NotStarted,
    /// The remote process exited with the given code.
    Exited(i32),
    /// The transport dropped before the process reported an exit code.
    Disconnected,
}

impl ExitStatus {
    /// Returns the numeric exit code, if the process reported one.
    #[must_use]
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::NotStarted | Self::Disconnected => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Final state of a command, delivered by the communicator that ran it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandCompletion {
    /// How the command ended.
    pub status: ExitStatus,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandCompletion {
    /// A completion for a process that exited with `code`.
    #[must_use]
    pub fn exited(code: i32) -> Self {
        Self {
            status: ExitStatus::Exited(code),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// A completion for a dropped transport.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            status: ExitStatus::Disconnected,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Handle a communicator uses to report a command's completion.
///
/// Dropping it without calling [`CompletionSender::complete`] reports the
/// command as disconnected.
#[derive(Debug)]
pub struct CompletionSender {
    tx: oneshot::Sender<CommandCompletion>,
}

impl CompletionSender {
    /// Delivers the command's final state.
    pub fn complete(self, completion: CommandCompletion) {
        if self.tx.send(completion).is_err() {
            debug!("command completion delivered after the waiter went away");
        }
    }
}

/// A command to run through a [`Communicator`].
#[derive(Debug)]
pub struct RemoteCmd {
    command: String,
    stdin: Option<Vec<u8>>,
    status: ExitStatus,
    stdout: String,
    stderr: String,
    pending: Option<oneshot::Receiver<CommandCompletion>>,
}

impl RemoteCmd {
    /// Creates a command from a shell command line.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            status: ExitStatus::NotStarted,
            stdout: String::new(),
            stderr: String::new(),
            pending: None,
        }
    }

    /// Feeds `input` to the command's standard input.
    #[must_use]
    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Returns the command line.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Takes the standard input payload, leaving none behind.
    pub fn take_stdin(&mut self) -> Option<Vec<u8>> {
        self.stdin.take()
    }

    /// Marks the command as launched and returns the completion handle.
    ///
    /// Communicators call this once the process is running.
    pub fn begin(&mut self) -> CompletionSender {
        let (tx, rx) = oneshot::channel();
        self.pending = Some(rx);
        self.status = ExitStatus::NotStarted;
        CompletionSender { tx }
    }

    /// Waits for the command to finish and returns its exit status.
    ///
    /// Returns [`ExitStatus::NotStarted`] when the command was never
    /// launched. Calling it again returns the recorded status.
    pub async fn wait(&mut self) -> ExitStatus {
        if let Some(pending) = self.pending.take() {
            match pending.await {
                Ok(completion) => {
                    self.status = completion.status;
                    self.stdout = completion.stdout;
                    self.stderr = completion.stderr;
                }
                Err(_) => self.status = ExitStatus::Disconnected,
            }
        }
        self.status
    }

    /// Returns the recorded exit status.
    #[must_use]
    pub const fn exit_status(&self) -> ExitStatus {
        self.status
    }

    /// Returns the captured standard output.
    #[must_use]
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Returns the captured standard error.
    #[must_use]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Starts the command, waits for it, and relays its output to `ui`.
    ///
    /// # Errors
    ///
    /// Returns the communicator's error when the command cannot be started.
    pub async fn run_with_ui(
        &mut self,
        cancel: &CancellationToken,
        comm: &dyn Communicator,
        ui: &dyn Ui,
    ) -> Result<ExitStatus, CommunicatorError> {
        comm.start(cancel, self).await?;
        let status = self.wait().await;
        for line in self.stdout.lines() {
            ui.message(line);
        }
        for line in self.stderr.lines() {
            ui.error(line);
        }
        Ok(status)
    }
}

/// Permission bits applied to uploaded files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Regular file, `0644`.
    pub const FILE: Self = Self(0o644);
    /// Executable, `0755`.
    pub const EXECUTABLE: Self = Self(0o755);
}

impl Default for FileMode {
    fn default() -> Self {
        Self::FILE
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

/// Errors raised by communicators.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommunicatorError {
    /// The transport could not be established.
    #[error("failed to connect to {target}: {message}")]
    Connect {
        /// Address that was dialled.
        target: String,
        /// Cause reported by the transport.
        message: String,
    },
    /// A local helper process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Reading or writing a local file failed.
    #[error("i/o error on {path}: {message}")]
    Io {
        /// Path involved in the failing operation.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// A file transfer completed unsuccessfully.
    #[error("transfer of {path} failed with {status}: {stderr}")]
    Transfer {
        /// Path being transferred.
        path: String,
        /// Exit status of the transfer helper.
        status: String,
        /// Diagnostic output of the transfer helper.
        stderr: String,
    },
    /// The transport dropped during a transfer.
    #[error("connection lost while transferring {path}")]
    Disconnected {
        /// Path being transferred.
        path: String,
    },
}

/// Future returned by communicator operations.
pub type CommFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CommunicatorError>> + Send + 'a>>;

/// Shared communicator handle stored in the state bag.
pub type SharedCommunicator = Arc<dyn Communicator>;

/// Remote execution and file transfer capability set.
///
/// A communicator serves one build's sequential calls; implementations are
/// not required to support concurrent use.
pub trait Communicator: Send + Sync {
    /// Launches `cmd` and returns once it is running.
    fn start<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        cmd: &'a mut RemoteCmd,
    ) -> CommFuture<'a, ()>;

    /// Writes `source` to `path`. Either the whole stream lands at `path` or
    /// an error is returned.
    fn upload<'a>(
        &'a self,
        path: &'a str,
        source: &'a mut (dyn AsyncRead + Send + Unpin),
        mode: FileMode,
    ) -> CommFuture<'a, ()>;

    /// Copies the local directory `source` to `destination`, skipping entries
    /// named in `exclude`. With a trailing `/` on `source` its contents are
    /// copied; without, the directory itself is.
    fn upload_dir<'a>(
        &'a self,
        destination: &'a str,
        source: &'a Utf8Path,
        exclude: &'a [String],
    ) -> CommFuture<'a, ()>;

    /// Streams the file at `path` into `sink`.
    fn download<'a>(
        &'a self,
        path: &'a str,
        sink: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> CommFuture<'a, ()>;

    /// Copies the directory `source` to the local `destination`.
    fn download_dir<'a>(
        &'a self,
        source: &'a str,
        destination: &'a Utf8Path,
        exclude: &'a [String],
    ) -> CommFuture<'a, ()>;
}

/// Spawns `command` with piped stdio and reports its completion through
/// `cmd`. An exit code equal to `disconnect_code`, or death by signal, is
/// reported as [`ExitStatus::Disconnected`].
fn launch(
    mut command: Command,
    program: &str,
    cancel: &CancellationToken,
    cmd: &mut RemoteCmd,
    disconnect_code: Option<i32>,
) -> Result<(), CommunicatorError> {
    let input = cmd.take_stdin();
    let stdin = if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    let mut child = command
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| CommunicatorError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        })?;

    let pipe = child.stdin.take();
    let sender = cmd.begin();
    let token = cancel.clone();
    tokio::spawn(async move {
        let feed = async move {
            if let (Some(mut pipe), Some(bytes)) = (pipe, input)
                && let Err(err) = pipe.write_all(&bytes).await
            {
                debug!(error = %err, "remote command closed stdin early");
            }
        };
        let completion = tokio::select! {
            ((), output) = async { tokio::join!(feed, child.wait_with_output()) } => match output {
                Ok(output) => {
                    let status = match output.status.code() {
                        Some(code) if Some(code) != disconnect_code => ExitStatus::Exited(code),
                        _ => ExitStatus::Disconnected,
                    };
                    CommandCompletion {
                        status,
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    }
                }
                Err(err) => {
                    debug!(error = %err, "failed to collect command output");
                    CommandCompletion::disconnected()
                }
            },
            () = token.cancelled() => CommandCompletion::disconnected(),
        };
        sender.complete(completion);
    });
    Ok(())
}
