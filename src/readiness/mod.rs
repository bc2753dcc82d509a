//! Bridges "the machine exists" and "the communicator can run commands".
//!
//! [`ReadinessWaiter::wait`] calls a [`Connector`] until it yields a live
//! communicator. Network failures (nothing listening yet, port flapping while
//! the guest reboots) are retried until the total timeout; handshake failures
//! (transport opened but login failed) are additionally bounded by
//! [`WaitConfig::handshake_limit`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::communicator::{
    LocalCommunicator, SharedCommunicator, SshCommunicator, SshConfig, SshTarget,
};
use crate::retry::{Retry, RetryError, RetryPolicy, retry};

/// Why a single connection attempt failed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectError {
    /// Nothing answered; the machine may still be booting.
    #[error("network unreachable: {0}")]
    Network(String),
    /// The transport opened but the protocol handshake or login failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SharedCommunicator, ConnectError>> + Send + 'a>>;

/// Produces a communicator for the machine, or explains why it cannot yet.
pub trait Connector: Send + Sync {
    /// Attempts one connection.
    fn connect(&self) -> ConnectFuture<'_>;
}

/// Timing parameters of a readiness wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitConfig {
    /// Bound on one [`Connector::connect`] call.
    pub attempt_timeout: Duration,
    /// Bound on the whole wait.
    pub total_timeout: Duration,
    /// Delay between failed attempts.
    pub poll_interval: Duration,
    /// Handshake failures tolerated before giving up.
    pub handshake_limit: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            handshake_limit: 10,
        }
    }
}

/// Reasons a readiness wait ended without a communicator.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// The cancellation token fired.
    #[error("readiness wait cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts started before cancellation.
        attempts: u32,
    },
    /// The total timeout elapsed.
    #[error(
        "timed out waiting for the machine after {attempts} attempt(s){}",
        describe_last(.last.as_ref())
    )]
    Timeout {
        /// Attempts started before the deadline.
        attempts: u32,
        /// Most recent failure.
        last: Option<ConnectError>,
    },
    /// Handshake failures exceeded the configured limit.
    #[error("giving up after {failures} handshake failure(s): {last}")]
    HandshakeLimit {
        /// Handshake failures observed.
        failures: u32,
        /// The failure that crossed the limit.
        last: ConnectError,
    },
}

fn describe_last(last: Option<&ConnectError>) -> String {
    last.map_or_else(String::new, |err| format!(": {err}"))
}

/// Polls a [`Connector`] until the machine is usable.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadinessWaiter {
    config: WaitConfig,
}

impl ReadinessWaiter {
    /// Creates a waiter with the given timing.
    #[must_use]
    pub const fn new(config: WaitConfig) -> Self {
        Self { config }
    }

    /// Returns the waiter's timing.
    #[must_use]
    pub const fn config(&self) -> WaitConfig {
        self.config
    }

    /// Waits for `connector` to yield a communicator.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Cancelled`] when `cancel` fires,
    /// [`WaitError::Timeout`] when the total timeout elapses and
    /// [`WaitError::HandshakeLimit`] when too many handshakes fail.
    pub async fn wait(
        &self,
        connector: &dyn Connector,
        cancel: &CancellationToken,
    ) -> Result<SharedCommunicator, WaitError> {
        let config = self.config;
        let handshakes = AtomicU32::new(0);
        let policy = RetryPolicy::new(config.total_timeout, config.poll_interval);

        let outcome = retry(policy, cancel, |attempt| {
            let counter = &handshakes;
            async move {
                let result = timeout(config.attempt_timeout, connector.connect())
                    .await
                    .unwrap_or_else(|_| {
                        Err(ConnectError::Network(format!(
                            "attempt timed out after {}",
                            humantime::format_duration(config.attempt_timeout)
                        )))
                    });
                match result {
                    Ok(comm) => {
                        info!(attempt, "machine is reachable");
                        Ok(comm)
                    }
                    Err(err @ ConnectError::Network(_)) => Err(Retry::Transient(err)),
                    Err(err @ ConnectError::Handshake(_)) => {
                        let failures = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!(attempt, failures, "handshake failed");
                        if failures > config.handshake_limit {
                            Err(Retry::Fatal(err))
                        } else {
                            Err(Retry::Transient(err))
                        }
                    }
                }
            }
        })
        .await;

        outcome.map_err(|err| match err {
            RetryError::Cancelled { attempts } => WaitError::Cancelled { attempts },
            RetryError::Timeout { attempts, last } => WaitError::Timeout { attempts, last },
            RetryError::Aborted { source, .. } => WaitError::HandshakeLimit {
                failures: handshakes.load(Ordering::SeqCst),
                last: source,
            },
        })
    }
}

/// Connects over SSH: a TCP connect first, then a full login running `true`.
#[derive(Clone, Debug)]
pub struct SshConnector {
    config: SshConfig,
    target: SshTarget,
}

impl SshConnector {
    /// Creates a connector for `target`.
    #[must_use]
    pub const fn new(config: SshConfig, target: SshTarget) -> Self {
        Self { config, target }
    }
}

impl Connector for SshConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let address = (self.target.host.as_str(), self.target.port);
            TcpStream::connect(address)
                .await
                .map_err(|err| ConnectError::Network(err.to_string()))?;

            let comm = SshCommunicator::new(self.config.clone(), self.target.clone());
            match comm.try_login().await {
                Ok(Some(0)) => Ok(Arc::new(comm) as SharedCommunicator),
                Ok(code) => Err(ConnectError::Handshake(format!(
                    "ssh {}@{}:{} exited with {}",
                    self.target.user,
                    self.target.host,
                    self.target.port,
                    code.map_or_else(|| String::from("a signal"), |c| format!("status {c}"))
                ))),
                Err(err) => Err(ConnectError::Handshake(err.to_string())),
            }
        })
    }
}

/// Connector for builds that run on the host itself; always ready.
#[derive(Clone, Debug, Default)]
pub struct LocalConnector {
    working_dir: Option<Utf8PathBuf>,
}

impl LocalConnector {
    /// Creates a connector whose communicator runs in `working_dir`.
    #[must_use]
    pub const fn new(working_dir: Option<Utf8PathBuf>) -> Self {
        Self { working_dir }
    }
}

impl Connector for LocalConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        let comm = self
            .working_dir
            .clone()
            .map_or_else(LocalCommunicator::new, LocalCommunicator::in_dir);
        Box::pin(async move { Ok(Arc::new(comm) as SharedCommunicator) })
    }
}

#[cfg(test)]
mod tests;
