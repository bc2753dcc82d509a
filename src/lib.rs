//! Core library for the Kiln machine image builder.
//!
//! A build is an ordered list of reversible steps sharing a typed state bag.
//! The [`runner::StepRunner`] executes the steps, honours cancellation and
//! cleans up in reverse order. Builders ([`null`], [`scaleway`] through the
//! generic [`cloud`] driver, and [`virtualbox`]) compose those steps;
//! provisioners reach the machine through a [`communicator::Communicator`]
//! once the [`readiness`] waiter has connected, and the [`bootcommand`]
//! engine types scripted keystrokes into consoles.

pub mod artifact;
pub mod bootcommand;
pub mod build;
pub mod cloud;
pub mod communicator;
pub mod config;
pub mod null;
pub mod process;
pub mod provision;
pub mod readiness;
pub mod retry;
pub mod runner;
pub mod scaleway;
pub mod state;
pub mod step;
pub mod steps;
pub mod template;
pub mod test_support;
pub mod ui;
pub mod virtualbox;

pub use artifact::{Artifact, ArtifactError, PostProcessor, publish};
pub use build::{Build, BuildError, Builder};
pub use communicator::{Communicator, CommunicatorError, RemoteCmd, SshConfig};
pub use config::{ConfigError, ScalewayConfig};
pub use process::{
    CommandError, CommandFuture, CommandOutput, CommandRunner, ProcessCommandRunner,
};
pub use retry::{Retry, RetryError, RetryPolicy, retry};
pub use runner::{DebugPause, PauseLocation, RunOutcome, StepRunner};
pub use scaleway::{ScalewayBackendError, ScalewayDriver};
pub use state::{StateBag, StateKey};
pub use step::{Action, Step, StepError};
pub use template::{Template, TemplateError};
pub use ui::{ConsoleUi, SharedUi, Ui};
pub use virtualbox::{VirtualBoxError, VirtualBoxVmBuilder};
