//! A named build: one builder, its provisioners and its post-processors.
//!
//! [`Build::run`] seeds a fresh state bag, hands the builder's steps to the
//! [`StepRunner`], and turns the outcome into an artifact or an error.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::artifact::{Artifact, PostProcessor};
use crate::provision::ProvisionHook;
use crate::runner::{DebugPause, RunOutcome, StepRunner};
use crate::state::{StateBag, keys};
use crate::step::{Step, StepError};
use crate::ui::SharedUi;

/// Errors raised while preparing or running a build.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// The builder rejected its configuration.
    #[error("{builder} configuration is invalid: {message}")]
    Prepare {
        /// Builder type.
        builder: String,
        /// Validation failure.
        message: String,
    },
    /// A step halted the build.
    #[error("build halted: {0}")]
    Halted(StepError),
    /// The build was cancelled.
    #[error("build cancelled")]
    Cancelled,
    /// The builder could not describe what it built.
    #[error("failed to collect artifact: {0}")]
    Artifact(String),
}

/// Produces the step list that builds one kind of machine.
pub trait Builder: Send + Sync {
    /// Template `type` of the builder.
    fn builder_type(&self) -> &str;

    /// Validates configuration and fills in defaults.
    ///
    /// Returns warnings worth showing to the user.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Prepare`] when the configuration cannot work.
    fn prepare(&mut self) -> Result<Vec<String>, BuildError>;

    /// Stores builder-specific values, such as drivers, in the bag.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Prepare`] when a value cannot be produced.
    fn seed(&self, _state: &StateBag) -> Result<(), BuildError> {
        Ok(())
    }

    /// Steps to run, in order.
    fn steps(&self) -> Vec<Box<dyn Step>>;

    /// Describes the result once every step completed.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Artifact`] when the bag lacks what the builder
    /// expected its steps to leave behind.
    fn artifact(&self, state: &StateBag) -> Result<Option<Box<dyn Artifact>>, BuildError>;
}

/// One build of a template.
pub struct Build {
    name: String,
    builder: Box<dyn Builder>,
    hook: Arc<ProvisionHook>,
    post_processors: Vec<Box<dyn PostProcessor>>,
    pause: Option<Arc<dyn DebugPause>>,
}

impl Build {
    /// Creates a build named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, builder: Box<dyn Builder>, hook: ProvisionHook) -> Self {
        Self {
            name: name.into(),
            builder,
            hook: Arc::new(hook),
            post_processors: Vec::new(),
            pause: None,
        }
    }

    /// Sets the post-processors applied to the artifact.
    #[must_use]
    pub fn with_post_processors(mut self, post_processors: Vec<Box<dyn PostProcessor>>) -> Self {
        self.post_processors = post_processors;
        self
    }

    /// Pauses at every step boundary.
    #[must_use]
    pub fn with_pause(mut self, pause: Arc<dyn DebugPause>) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Build name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builder type.
    #[must_use]
    pub fn builder_type(&self) -> &str {
        self.builder.builder_type()
    }

    /// Post-processors applied to this build's artifact.
    #[must_use]
    pub fn post_processors(&self) -> &[Box<dyn PostProcessor>] {
        &self.post_processors
    }

    /// Validates the builder configuration.
    ///
    /// # Errors
    ///
    /// Returns the builder's [`BuildError::Prepare`].
    pub fn prepare(&mut self) -> Result<Vec<String>, BuildError> {
        self.builder.prepare()
    }

    /// Runs the builder's steps and returns its artifact.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Halted`] with the step's recorded error,
    /// [`BuildError::Cancelled`], or a seeding or artifact failure.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        ui: SharedUi,
    ) -> Result<Option<Box<dyn Artifact>>, BuildError> {
        let span = info_span!("build", name = %self.name, builder = self.builder_type());
        async {
            let state = StateBag::new();
            state.put(keys::UI, ui);
            state.put_arc(keys::HOOK, Arc::clone(&self.hook));
            state.put(keys::BUILD_NAME, self.name.clone());
            state.put(keys::BUILDER_TYPE, self.builder_type().to_owned());
            self.builder.seed(&state)?;

            let mut runner = StepRunner::new(self.builder.steps());
            if let Some(pause) = &self.pause {
                runner = runner.with_pause(Arc::clone(pause));
            }
            info!(steps = runner.len(), "starting build");

            match runner.run(cancel, &state).await {
                RunOutcome::Completed => self.builder.artifact(&state),
                RunOutcome::Cancelled => Err(BuildError::Cancelled),
                RunOutcome::Halted => Err(BuildError::Halted(
                    state
                        .get_cloned(keys::ERROR)
                        .unwrap_or_else(|| StepError::new(&self.name, "halted without an error")),
                )),
            }
        }
        .instrument(span)
        .await
    }
}

impl fmt::Debug for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Build")
            .field("name", &self.name)
            .field("builder", &self.builder_type())
            .field("provisioners", &self.hook.len())
            .field("post_processors", &self.post_processors.len())
            .finish()
    }
}
