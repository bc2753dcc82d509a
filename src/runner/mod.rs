//! Ordered executor of reversible steps.
//!
//! [`StepRunner`] drives each step exactly once, stops at the first halt or
//! cancellation, and then cleans up every step whose `run` was started in
//! strictly reverse order. Cancellation never skips cleanup.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::state::{StateBag, keys};
use crate::step::{Action, Step, StepFuture};

/// Message shown before cleanup when a run is cancelled.
pub const CANCELLING_MESSAGE: &str = "Cancelling...";

/// Boundary at which a [`DebugPause`] is invoked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PauseLocation {
    /// Immediately before a step's `run`.
    BeforeStep,
    /// Immediately after a step's `run` returned a non-stopping action.
    AfterStep,
}

impl fmt::Display for PauseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeStep => f.write_str("before"),
            Self::AfterStep => f.write_str("after"),
        }
    }
}

/// Interactive hook invoked at step boundaries in debug mode.
///
/// The runner blocks until the returned future completes.
pub trait DebugPause: Send + Sync {
    /// Pauses at `location` relative to the step named `step`.
    fn pause<'a>(
        &'a self,
        location: PauseLocation,
        step: &'a str,
        state: &'a StateBag,
    ) -> StepFuture<'a, ()>;
}

/// How a run of the step list ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// Every step ran and none stopped the run.
    Completed,
    /// A step returned [`Action::Halt`].
    Halted,
    /// A step returned [`Action::Cancel`] or cancellation was requested.
    Cancelled,
}

/// Runs an ordered list of steps with LIFO cleanup.
pub struct StepRunner {
    steps: Vec<Box<dyn Step>>,
    pause: Option<Arc<dyn DebugPause>>,
}

impl StepRunner {
    /// Creates a runner over `steps`, executed in the given order.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps, pause: None }
    }

    /// Installs a debug pause invoked before and after every step.
    #[must_use]
    pub fn with_pause(mut self, pause: Arc<dyn DebugPause>) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Returns the number of steps in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` when there are no steps to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drives the steps once and cleans up whatever was started.
    ///
    /// The halted and cancelled flags of `state` mirror the outcome.
    pub async fn run(&mut self, cancel: &CancellationToken, state: &StateBag) -> RunOutcome {
        let mut outcome = RunOutcome::Completed;
        let mut started = 0_usize;

        for step in &mut self.steps {
            if cancellation_requested(cancel, state) {
                outcome = RunOutcome::Cancelled;
                break;
            }

            if let Some(pause) = &self.pause {
                pause
                    .pause(PauseLocation::BeforeStep, step.name(), state)
                    .await;
            }

            started += 1;
            debug!(step = step.name(), "running step");
            let action = step.run(cancel, state).await;
            debug!(step = step.name(), %action, "step finished");

            match action {
                Action::Halt => {
                    state.mark_halted();
                    outcome = RunOutcome::Halted;
                    break;
                }
                Action::Cancel => {
                    state.mark_cancelled();
                    outcome = RunOutcome::Cancelled;
                    break;
                }
                Action::Continue | Action::Skip if cancellation_requested(cancel, state) => {
                    outcome = RunOutcome::Cancelled;
                    break;
                }
                Action::Continue | Action::Skip => {}
            }

            if let Some(pause) = &self.pause {
                pause
                    .pause(PauseLocation::AfterStep, step.name(), state)
                    .await;
            }
        }

        if outcome == RunOutcome::Cancelled
            && let Some(ui) = state.get(keys::UI)
        {
            ui.say(CANCELLING_MESSAGE);
        }

        for step in self.steps.iter_mut().take(started).rev() {
            debug!(step = step.name(), "cleaning up step");
            step.cleanup(state).await;
        }

        info!(?outcome, steps = started, "step run complete");
        outcome
    }
}

/// Records a pending cancellation in `state`; a step that returned
/// `Continue` after the token fired does not complete the run.
fn cancellation_requested(cancel: &CancellationToken, state: &StateBag) -> bool {
    if !cancel.is_cancelled() && !state.is_cancelled() {
        return false;
    }
    state.mark_cancelled();
    state.mark_halted();
    true
}

impl fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.steps.iter().map(|step| step.name()).collect();
        f.debug_struct("StepRunner")
            .field("steps", &names)
            .field("debug", &self.pause.is_some())
            .finish()
    }
}
