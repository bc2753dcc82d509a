//! The two-phase unit of work driven by the step runner.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::state::{StateBag, keys};

/// Outcome of [`Step::run`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Proceed to the next step.
    Continue,
    /// Record a failure and begin cleanup.
    Halt,
    /// Stop because the user asked to abort and begin cleanup.
    Cancel,
    /// Proceed like [`Action::Continue`]; later steps may branch on it
    /// through the state bag.
    Skip,
}

impl Action {
    /// Returns `true` for the actions that end the run early.
    #[must_use]
    pub const fn stops_run(self) -> bool {
        matches!(self, Self::Halt | Self::Cancel)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Continue => "continue",
            Self::Halt => "halt",
            Self::Cancel => "cancel",
            Self::Skip => "skip",
        };
        f.write_str(label)
    }
}

/// Failure recorded under the `error` state key by a halting step.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{step}: {message}")]
pub struct StepError {
    /// Name of the step that failed.
    pub step: String,
    /// Rendered cause.
    pub message: String,
}

impl StepError {
    /// Creates an error attributed to `step`.
    #[must_use]
    pub fn new(step: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

/// Future returned by step operations.
pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One reversible unit of build work.
///
/// `cleanup` is invoked if and only if `run` was started, including when it
/// returned [`Action::Halt`] or [`Action::Cancel`] part way through, so it
/// must tolerate partially applied work. It reports problems through the UI
/// and never fails.
pub trait Step: Send {
    /// Short name used in logs, debug pauses and error messages.
    fn name(&self) -> &str;

    /// Performs the step. Long waits should observe `cancel`.
    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action>;

    /// Reverts whatever `run` managed to do.
    fn cleanup<'a>(&'a mut self, _state: &'a StateBag) -> StepFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Records `error` in the bag, reports it, and returns [`Action::Halt`].
///
/// This is the common tail of a failing step.
pub fn halt(state: &StateBag, error: StepError) -> Action {
    tracing::warn!(step = %error.step, error = %error.message, "step halted");
    if let Some(ui) = state.get(keys::UI) {
        ui.error(&error.to_string());
    }
    state.put(keys::ERROR, error);
    Action::Halt
}
