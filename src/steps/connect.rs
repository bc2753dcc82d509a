//! Waits for the machine's communicator and publishes it.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::communicator::{SshConfig, SshTarget};
use crate::readiness::{
    Connector, LocalConnector, ReadinessWaiter, SshConnector, WaitConfig, WaitError,
};
use crate::state::{StateBag, keys};
use crate::step::{Action, Step, StepError, StepFuture, halt};
use crate::template::duration;
use crate::ui;

const NAME: &str = "connect";
const DEFAULT_SSH_PORT: u16 = 22;

/// Transport used to reach the machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CommunicatorKind {
    /// The system `ssh` client.
    #[default]
    Ssh,
    /// Commands run on the host running the build.
    Local,
    /// No communicator; provisioners cannot run.
    None,
}

const fn default_ssh_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_handshake_attempts() -> u32 {
    10
}

/// Communicator settings shared by every builder's template entry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CommConfig {
    /// Transport.
    #[serde(default)]
    pub communicator: CommunicatorKind,
    /// Fixed SSH host; otherwise the builder publishes one.
    #[serde(default)]
    pub ssh_host: Option<String>,
    /// SSH port on the machine.
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Account to log in as; defaults to the `ssh_user` setting.
    #[serde(default)]
    pub ssh_username: Option<String>,
    /// Private key; defaults to the `ssh_identity_file` setting.
    #[serde(default)]
    pub ssh_private_key_file: Option<String>,
    /// Upper bound on waiting for SSH to come up.
    #[serde(default = "default_ssh_timeout", deserialize_with = "duration::deserialize")]
    pub ssh_timeout: Duration,
    /// Failed logins tolerated while waiting.
    #[serde(default = "default_handshake_attempts")]
    pub ssh_handshake_attempts: u32,
    /// Working directory of the local communicator.
    #[serde(default)]
    pub local_dir: Option<Utf8PathBuf>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            communicator: CommunicatorKind::default(),
            ssh_host: None,
            ssh_port: None,
            ssh_username: None,
            ssh_private_key_file: None,
            ssh_timeout: default_ssh_timeout(),
            ssh_handshake_attempts: default_handshake_attempts(),
            local_dir: None,
        }
    }
}

impl CommConfig {
    /// Readiness timing derived from these settings.
    #[must_use]
    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig {
            total_timeout: self.ssh_timeout,
            handshake_limit: self.ssh_handshake_attempts,
            ..WaitConfig::default()
        }
    }

    /// Applies the template's user and key over the shared SSH settings.
    #[must_use]
    pub fn ssh_settings(&self, base: &SshConfig) -> SshConfig {
        let mut settings = base.clone();
        if let Some(user) = &self.ssh_username {
            settings.ssh_user.clone_from(user);
        }
        if let Some(key) = &self.ssh_private_key_file {
            settings.ssh_identity_file = Some(key.clone());
        }
        settings
    }

    /// Resolves the SSH endpoint from these settings and the state bag.
    ///
    /// The host comes from `ssh_host` or the bag's `ssh_host` key; a port
    /// forward published under `ssh_host_port` wins over `ssh_port`.
    ///
    /// # Errors
    ///
    /// Returns a message when no host is known.
    pub fn ssh_target(&self, ssh: &SshConfig, state: &StateBag) -> Result<SshTarget, String> {
        let host = self
            .ssh_host
            .clone()
            .or_else(|| state.get_cloned(keys::SSH_HOST))
            .ok_or_else(|| String::from("no ssh_host configured and the builder published none"))?;
        let port = state
            .get_cloned(keys::SSH_HOST_PORT)
            .or(self.ssh_port)
            .unwrap_or(DEFAULT_SSH_PORT);
        Ok(SshTarget {
            host,
            port,
            user: ssh.ssh_user.clone(),
        })
    }
}

/// Builds the connector once the machine's address is known.
pub type ConnectorFactory =
    Box<dyn Fn(&StateBag) -> Result<Box<dyn Connector>, String> + Send + Sync>;

/// Waits for the machine to accept connections and publishes the live
/// communicator under `communicator`.
pub struct StepConnect {
    waiter: ReadinessWaiter,
    factory: ConnectorFactory,
}

impl StepConnect {
    /// Creates a step waiting with `wait` on connectors made by `factory`.
    #[must_use]
    pub fn new(wait: WaitConfig, factory: ConnectorFactory) -> Self {
        Self {
            waiter: ReadinessWaiter::new(wait),
            factory,
        }
    }

    /// Builds the step a template's communicator settings call for.
    ///
    /// Returns `None` for `"communicator": "none"`. An SSH communicator
    /// without loaded `ssh` settings yields a step that halts.
    #[must_use]
    pub fn from_config(comm: &CommConfig, ssh: Option<&SshConfig>) -> Option<Self> {
        let wait = comm.wait_config();
        match comm.communicator {
            CommunicatorKind::None => None,
            CommunicatorKind::Local => {
                let dir = comm.local_dir.clone();
                Some(Self::new(
                    wait,
                    Box::new(move |_| {
                        Ok(Box::new(LocalConnector::new(dir.clone())) as Box<dyn Connector>)
                    }),
                ))
            }
            CommunicatorKind::Ssh => {
                let owned = comm.clone();
                let settings = ssh.map(|base| owned.ssh_settings(base));
                Some(Self::new(
                    wait,
                    Box::new(move |state| {
                        let resolved = settings
                            .clone()
                            .ok_or_else(|| String::from("ssh settings were not loaded"))?;
                        let target = owned.ssh_target(&resolved, state)?;
                        Ok(Box::new(SshConnector::new(resolved, target)) as Box<dyn Connector>)
                    }),
                ))
            }
        }
    }
}

/// Loads the shared SSH settings when `comm` connects over SSH.
///
/// # Errors
///
/// Returns a message when the settings cannot be loaded or are invalid.
pub fn load_ssh_settings(comm: &CommConfig) -> Result<Option<SshConfig>, String> {
    if comm.communicator != CommunicatorKind::Ssh {
        return Ok(None);
    }
    let base = SshConfig::load_without_cli_args().map_err(|err| err.to_string())?;
    let settings = comm.ssh_settings(&base);
    settings.validate().map_err(|err| err.to_string())?;
    Ok(Some(settings))
}

impl std::fmt::Debug for StepConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepConnect")
            .field("wait", &self.waiter.config())
            .finish_non_exhaustive()
    }
}

impl Step for StepConnect {
    fn name(&self) -> &str {
        NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            let ui = ui::from_state(state);
            let connector = match (self.factory)(state) {
                Ok(connector) => connector,
                Err(message) => return halt(state, StepError::new(NAME, message)),
            };

            ui.say("Waiting for the communicator to become available...");
            match self.waiter.wait(connector.as_ref(), cancel).await {
                Ok(comm) => {
                    state.put(keys::COMMUNICATOR, comm);
                    ui.say("Connected to the machine");
                    Action::Continue
                }
                Err(WaitError::Cancelled { .. }) => Action::Cancel,
                Err(err) => halt(state, StepError::new(NAME, err)),
            }
        })
    }

    fn cleanup<'a>(&'a mut self, state: &'a StateBag) -> StepFuture<'a, ()> {
        Box::pin(async move {
            state.remove(keys::COMMUNICATOR);
        })
    }
}
