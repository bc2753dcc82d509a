//! Halts the machine, gracefully when a shutdown command is configured.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::communicator::RemoteCmd;
use crate::retry::{Retry, RetryError, RetryPolicy, retry};
use crate::state::{StateBag, keys};
use crate::step::{Action, Step, StepError, StepFuture, halt};
use crate::ui;

const NAME: &str = "shutdown";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Failure reported by a [`MachineControl`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct MachineError(pub String);

/// Future returned by [`MachineControl`] operations.
pub type MachineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MachineError>> + Send + 'a>>;

/// Power control over the machine under construction.
///
/// Implementations find the machine through the state bag, for example by
/// its `vm_name` or `instance_id`.
pub trait MachineControl: Send + Sync {
    /// Reports whether the machine is still running.
    fn is_running<'a>(&'a self, state: &'a StateBag) -> MachineFuture<'a, bool>;

    /// Powers the machine off forcefully, giving up when `cancel` fires.
    fn stop<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> MachineFuture<'a, ()>;
}

/// Shuts the machine down.
///
/// With a `shutdown_command` the command is started over the communicator
/// and the machine is polled until it stops or `timeout` elapses. Without
/// one the machine is powered off directly.
pub struct StepShutdown {
    command: Option<String>,
    timeout: Duration,
    poll_interval: Duration,
    machine: Arc<dyn MachineControl>,
}

impl StepShutdown {
    /// Creates the step.
    #[must_use]
    pub fn new(
        command: Option<String>,
        timeout: Duration,
        machine: Arc<dyn MachineControl>,
    ) -> Self {
        Self {
            command: command.filter(|line| !line.trim().is_empty()),
            timeout,
            poll_interval: POLL_INTERVAL,
            machine,
        }
    }

    async fn graceful(
        &self,
        command: &str,
        cancel: &CancellationToken,
        state: &StateBag,
    ) -> Action {
        let ui = ui::from_state(state);
        let Some(comm) = state.get(keys::COMMUNICATOR) else {
            return halt(
                state,
                StepError::new(NAME, "shutdown_command is set but the build has no communicator"),
            );
        };

        ui.say("Gracefully halting the machine...");
        let mut cmd = RemoteCmd::new(command);
        if let Err(err) = comm.start(cancel, &mut cmd).await {
            return halt(
                state,
                StepError::new(NAME, format!("failed to send shutdown command: {err}")),
            );
        }

        ui.say(&format!(
            "Waiting up to {} for the machine to stop...",
            humantime::format_duration(self.timeout)
        ));
        let policy = RetryPolicy::new(self.timeout, self.poll_interval);
        let outcome = retry(policy, cancel, |attempt| async move {
            match self.machine.is_running(state).await {
                Ok(false) => Ok(()),
                Ok(true) => {
                    debug!(attempt, "machine still running");
                    Err(Retry::Transient(MachineError(String::from("machine is still running"))))
                }
                Err(err) => Err(Retry::Fatal(err)),
            }
        })
        .await;

        match outcome {
            Ok(()) => Action::Continue,
            Err(RetryError::Cancelled { .. }) => Action::Cancel,
            Err(RetryError::Timeout { .. }) => halt(
                state,
                StepError::new(
                    NAME,
                    format!(
                        "timed out after {} waiting for the machine to shut down",
                        humantime::format_duration(self.timeout)
                    ),
                ),
            ),
            Err(RetryError::Aborted { source, .. }) => halt(state, StepError::new(NAME, source)),
        }
    }
}

impl std::fmt::Debug for StepShutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepShutdown")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Step for StepShutdown {
    fn name(&self) -> &str {
        NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            if let Some(command) = self.command.clone() {
                return self.graceful(&command, cancel, state).await;
            }

            ui::from_state(state).say("Halting the machine...");
            match self.machine.stop(cancel, state).await {
                Ok(()) => Action::Continue,
                Err(_) if cancel.is_cancelled() => Action::Cancel,
                Err(err) => halt(state, StepError::new(NAME, err)),
            }
        })
    }
}
