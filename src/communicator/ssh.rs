//! Communicator backed by the system `ssh` and `rsync` clients.
//!
//! Commands run through `ssh user@host -- <command>`. The client exits with
//! 255 when the connection itself fails or drops, which maps to
//! [`ExitStatus::Disconnected`](super::ExitStatus::Disconnected). Uploads
//! stream into a temporary sibling file that is renamed into place only
//! once complete.

use std::ffi::OsString;
use std::process::Output;

use camino::Utf8Path;
use shell_escape::unix::escape;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::config::expand_tilde;
use super::{CommFuture, Communicator, CommunicatorError, FileMode, RemoteCmd, SshConfig, launch};

/// Exit status `ssh` reserves for connection failures.
pub(crate) const SSH_CONNECTION_FAILURE: i32 = 255;

/// Address and account of an SSH endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Account to log in as.
    pub user: String,
}

impl SshTarget {
    fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Runs commands and moves files over SSH.
#[derive(Clone, Debug)]
pub struct SshCommunicator {
    config: SshConfig,
    target: SshTarget,
}

impl SshCommunicator {
    /// Creates a communicator for `target`.
    #[must_use]
    pub const fn new(config: SshConfig, target: SshTarget) -> Self {
        Self { config, target }
    }

    /// Returns the endpoint this communicator talks to.
    #[must_use]
    pub const fn target(&self) -> &SshTarget {
        &self.target
    }

    pub(crate) fn ssh_args(&self, remote_command: &str) -> Vec<OsString> {
        let mut args = self.common_ssh_options();
        args.push(OsString::from(self.target.login()));
        args.push(OsString::from("--"));
        args.push(OsString::from(remote_command));
        args
    }

    fn common_ssh_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.target.port.to_string()),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.config.ssh_connect_timeout
            )),
        ];

        if let Some(ref identity_file) = self.config.ssh_identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args
    }

    fn remote_shell(&self) -> String {
        let opts = self
            .common_ssh_options()
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {}", self.config.ssh_bin, opts)
    }

    pub(crate) fn rsync_args(
        &self,
        source: &str,
        destination: &str,
        exclude: &[String],
    ) -> Vec<OsString> {
        let mut args = vec![OsString::from("-az")];
        for pattern in exclude {
            args.push(OsString::from("--exclude"));
            args.push(OsString::from(pattern));
        }
        args.push(OsString::from("--rsh"));
        args.push(OsString::from(self.remote_shell()));
        args.push(OsString::from(source));
        args.push(OsString::from(destination));
        args
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{path}", self.target.login())
    }

    /// Runs `remote_command` to completion, feeding `input` to its stdin.
    async fn run_captured(
        &self,
        remote_command: &str,
        input: Option<&[u8]>,
    ) -> Result<Output, CommunicatorError> {
        let mut command = Command::new(&self.config.ssh_bin);
        command
            .args(self.ssh_args(remote_command))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(if input.is_some() {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| CommunicatorError::Spawn {
            program: self.config.ssh_bin.clone(),
            message: err.to_string(),
        })?;

        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(bytes)) = (pipe, input) {
                pipe.write_all(bytes).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        if let Err(err) = fed {
            debug!(error = %err, "ssh closed stdin early");
        }
        output.map_err(|err| CommunicatorError::Spawn {
            program: self.config.ssh_bin.clone(),
            message: err.to_string(),
        })
    }

    async fn run_rsync(&self, args: Vec<OsString>, path: &str) -> Result<(), CommunicatorError> {
        let output = Command::new(&self.config.rsync_bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| CommunicatorError::Spawn {
                program: self.config.rsync_bin.clone(),
                message: err.to_string(),
            })?;
        transfer_result(path, &output)
    }

    /// Runs `true` on the target to prove a full login succeeds.
    ///
    /// Returns the `ssh` exit code.
    pub(crate) async fn try_login(&self) -> Result<Option<i32>, CommunicatorError> {
        let output = self.run_captured("true", None).await?;
        Ok(output.status.code())
    }
}

fn transfer_result(path: &str, output: &Output) -> Result<(), CommunicatorError> {
    match output.status.code() {
        Some(0) => Ok(()),
        Some(SSH_CONNECTION_FAILURE) | None => Err(CommunicatorError::Disconnected {
            path: path.to_owned(),
        }),
        Some(code) => Err(CommunicatorError::Transfer {
            path: path.to_owned(),
            status: format!("exit status {code}"),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        }),
    }
}

/// Shell snippet that writes stdin to a staging file and renames it over
/// `path`, removing the staging file on failure.
pub(crate) fn atomic_write_command(path: &str, mode: FileMode) -> String {
    let staging = format!("{path}.kiln-{}", Uuid::new_v4().simple());
    let target = escape(path.into());
    let temp = escape(staging.into());
    format!(
        "cat > {temp} && chmod {mode} {temp} && mv -f {temp} {target} || {{ rm -f {temp}; exit 1; }}"
    )
}

impl Communicator for SshCommunicator {
    fn start<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        cmd: &'a mut RemoteCmd,
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let mut command = Command::new(&self.config.ssh_bin);
            command.args(self.ssh_args(cmd.command()));
            debug!(host = %self.target.host, command = cmd.command(), "starting remote command");
            launch(
                command,
                &self.config.ssh_bin,
                cancel,
                cmd,
                Some(SSH_CONNECTION_FAILURE),
            )
        })
    }

    fn upload<'a>(
        &'a self,
        path: &'a str,
        source: &'a mut (dyn AsyncRead + Send + Unpin),
        mode: FileMode,
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let mut bytes = Vec::new();
            source
                .read_to_end(&mut bytes)
                .await
                .map_err(|err| CommunicatorError::Io {
                    path: path.to_owned(),
                    message: err.to_string(),
                })?;
            let output = self
                .run_captured(&atomic_write_command(path, mode), Some(&bytes))
                .await?;
            transfer_result(path, &output)
        })
    }

    fn upload_dir<'a>(
        &'a self,
        destination: &'a str,
        source: &'a Utf8Path,
        exclude: &'a [String],
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let args = self.rsync_args(source.as_str(), &self.remote_spec(destination), exclude);
            self.run_rsync(args, destination).await
        })
    }

    fn download<'a>(
        &'a self,
        path: &'a str,
        sink: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let remote = format!("cat {}", escape(path.into()));
            let output = self.run_captured(&remote, None).await?;
            transfer_result(path, &output)?;
            let io_error = |err: std::io::Error| CommunicatorError::Io {
                path: path.to_owned(),
                message: err.to_string(),
            };
            sink.write_all(&output.stdout).await.map_err(io_error)?;
            sink.flush().await.map_err(io_error)
        })
    }

    fn download_dir<'a>(
        &'a self,
        source: &'a str,
        destination: &'a Utf8Path,
        exclude: &'a [String],
    ) -> CommFuture<'a, ()> {
        Box::pin(async move {
            let args = self.rsync_args(&self.remote_spec(source), destination.as_str(), exclude);
            self.run_rsync(args, source).await
        })
    }
}
