//! Builder that provisions an existing machine and produces no artifact.
//!
//! Useful for exercising provisioners against a host that is already
//! running, or against the local machine with `"communicator": "local"`.

use serde::Deserialize;

use crate::artifact::Artifact;
use crate::build::{BuildError, Builder};
use crate::communicator::SshConfig;
use crate::state::StateBag;
use crate::step::Step;
use crate::steps::{CommConfig, CommunicatorKind, StepConnect, StepProvision, load_ssh_settings};

/// Template `type` of the null builder.
pub const BUILDER_TYPE: &str = "null";

/// Template settings for the null builder.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct NullConfig {
    /// How to reach the machine.
    #[serde(flatten)]
    pub comm: CommConfig,
}

/// Connects, provisions and stops.
#[derive(Clone, Debug)]
pub struct NullBuilder {
    config: NullConfig,
    ssh: Option<SshConfig>,
}

impl NullBuilder {
    /// Creates the builder; SSH settings are loaded by [`Builder::prepare`].
    #[must_use]
    pub const fn new(config: NullConfig) -> Self {
        Self { config, ssh: None }
    }

    /// Uses `ssh` instead of loading settings from the environment.
    #[must_use]
    pub fn with_ssh_config(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }
}

impl Builder for NullBuilder {
    fn builder_type(&self) -> &str {
        BUILDER_TYPE
    }

    fn prepare(&mut self) -> Result<Vec<String>, BuildError> {
        let prepare_error = |message: String| BuildError::Prepare {
            builder: String::from(BUILDER_TYPE),
            message,
        };
        let comm = &self.config.comm;
        let mut warnings = Vec::new();
        match comm.communicator {
            CommunicatorKind::Ssh => {
                if comm.ssh_host.as_deref().is_none_or(|host| host.trim().is_empty()) {
                    return Err(prepare_error(String::from(
                        "ssh_host must be set when the communicator is ssh",
                    )));
                }
                if self.ssh.is_none() {
                    self.ssh = load_ssh_settings(comm).map_err(prepare_error)?;
                }
            }
            CommunicatorKind::Local => {}
            CommunicatorKind::None => warnings.push(String::from(
                "communicator is none; provisioners will fail if any apply to this build",
            )),
        }
        Ok(warnings)
    }

    fn steps(&self) -> Vec<Box<dyn Step>> {
        let mut steps: Vec<Box<dyn Step>> = Vec::new();
        if let Some(connect) = StepConnect::from_config(&self.config.comm, self.ssh.as_ref()) {
            steps.push(Box::new(connect));
        }
        steps.push(Box::new(StepProvision));
        steps
    }

    fn artifact(&self, _state: &StateBag) -> Result<Option<Box<dyn Artifact>>, BuildError> {
        Ok(None)
    }
}
