//! Provisioner contract and the hook the provision step dispatches through.
//!
//! A [`ProvisionHook`] is seeded into the state bag under the `hook` key. The
//! provision step hands it the live communicator and the hook runs every
//! configured provisioner in template order, honouring each one's
//! `pause_before` and `max_retries` settings.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::communicator::{Communicator, CommunicatorError};
use crate::state::{StateBag, keys};
use crate::template::RenderError;
use crate::ui::Ui;

mod shell;

pub use shell::{ShellConfig, ShellProvisioner};

/// Build facts exported to provisioners as `PACKER_*` variables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionData {
    /// Name of the running build.
    pub build_name: String,
    /// Type of the builder driving the build.
    pub builder_type: String,
    /// Address of the HTTP server, when one runs.
    pub http_ip: Option<String>,
    /// Port of the HTTP server, when one runs.
    pub http_port: Option<u16>,
}

impl ProvisionData {
    /// Collects the build facts published in `state`.
    #[must_use]
    pub fn from_state(state: &StateBag) -> Self {
        Self {
            build_name: state.get_cloned(keys::BUILD_NAME).unwrap_or_default(),
            builder_type: state.get_cloned(keys::BUILDER_TYPE).unwrap_or_default(),
            http_ip: state.get_cloned(keys::HTTP_IP),
            http_port: state.get_cloned(keys::HTTP_PORT),
        }
    }

    /// Environment variables every provisioner receives.
    #[must_use]
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (String::from("PACKER_BUILD_NAME"), self.build_name.clone()),
            (String::from("PACKER_BUILDER_TYPE"), self.builder_type.clone()),
        ];
        if let (Some(ip), Some(port)) = (&self.http_ip, self.http_port) {
            vars.push((String::from("PACKER_HTTP_ADDR"), format!("{ip}:{port}")));
            vars.push((String::from("PACKER_HTTP_IP"), ip.clone()));
            vars.push((String::from("PACKER_HTTP_PORT"), port.to_string()));
        }
        vars
    }
}

/// Errors raised while provisioning.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Provisioners are configured but no communicator was connected.
    #[error("provisioners are configured but the build has no communicator")]
    NoCommunicator,
    /// The cancellation token fired.
    #[error("provisioning cancelled")]
    Cancelled,
    /// The provisioner's configuration is invalid.
    #[error("invalid {provisioner} provisioner configuration: {message}")]
    Config {
        /// Provisioner type.
        provisioner: String,
        /// What is wrong.
        message: String,
    },
    /// A command template could not be rendered.
    #[error("failed to render {field}: {source}")]
    Render {
        /// Template field being rendered.
        field: String,
        /// Rendering failure.
        #[source]
        source: RenderError,
    },
    /// A local script could not be read.
    #[error("failed to read script {path}: {message}")]
    Script {
        /// Local script path.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// The communicator failed.
    #[error(transparent)]
    Communicator(#[from] CommunicatorError),
    /// A remote command exited with a code outside the accepted set.
    #[error("script {script} exited with {code}; accepted codes are {valid:?}")]
    ExitCode {
        /// Remote script path.
        script: String,
        /// Reported exit code.
        code: i32,
        /// Accepted exit codes.
        valid: Vec<i32>,
    },
    /// The connection dropped while a script ran and that was not expected.
    #[error("connection lost while running {script}; set expect_disconnect if the script reboots")]
    Disconnected {
        /// Remote script path.
        script: String,
    },
    /// The communicator kept failing until the start retry timeout.
    #[error("gave up on {action} after {}: {message}", humantime::format_duration(*.timeout))]
    RetryTimeout {
        /// What was being retried.
        action: String,
        /// Configured timeout.
        timeout: Duration,
        /// Last failure.
        message: String,
    },
}

/// Arguments passed to [`Provisioner::provision`].
#[derive(Clone, Copy)]
pub struct ProvisionContext<'a> {
    /// Cancelled when the build is aborted.
    pub cancel: &'a CancellationToken,
    /// Progress output.
    pub ui: &'a dyn Ui,
    /// Live connection to the machine.
    pub comm: &'a dyn Communicator,
    /// Build facts.
    pub data: &'a ProvisionData,
}

/// Future returned by [`Provisioner::provision`].
pub type ProvisionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), ProvisionError>> + Send + 'a>>;

/// Configures the machine through a communicator.
pub trait Provisioner: Send + Sync {
    /// Template `type` of this provisioner.
    fn provisioner_type(&self) -> &str;

    /// Runs the provisioner against the machine.
    fn provision<'a>(&'a self, ctx: ProvisionContext<'a>) -> ProvisionFuture<'a>;
}

/// A provisioner with the hook-level settings from its template entry.
pub struct HookedProvisioner {
    provisioner: Box<dyn Provisioner>,
    pause_before: Option<Duration>,
    max_retries: u32,
}

impl HookedProvisioner {
    /// Wraps `provisioner` with no pause and no retries.
    #[must_use]
    pub const fn new(provisioner: Box<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            pause_before: None,
            max_retries: 0,
        }
    }

    /// Sleeps `pause` before running.
    #[must_use]
    pub const fn with_pause_before(mut self, pause: Option<Duration>) -> Self {
        self.pause_before = pause;
        self
    }

    /// Re-runs a failed provisioner up to `retries` more times.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    async fn run(&self, ctx: ProvisionContext<'_>) -> Result<(), ProvisionError> {
        let kind = self.provisioner.provisioner_type();
        if let Some(pause) = self.pause_before {
            ctx.ui.say(&format!(
                "Pausing {} before the next provisioner...",
                humantime::format_duration(pause)
            ));
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(ProvisionError::Cancelled),
                () = tokio::time::sleep(pause) => {}
            }
        }

        ctx.ui.say(&format!("Provisioning with {kind}..."));
        let mut attempt = 0;
        loop {
            match self.provisioner.provision(ctx).await {
                Ok(()) => return Ok(()),
                Err(ProvisionError::Cancelled) => return Err(ProvisionError::Cancelled),
                Err(_) if ctx.cancel.is_cancelled() => return Err(ProvisionError::Cancelled),
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        provisioner = kind,
                        attempt,
                        error = %err,
                        "provisioner failed; retrying"
                    );
                    ctx.ui
                        .error(&format!("{kind} provisioner failed, retrying: {err}"));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for HookedProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookedProvisioner")
            .field("type", &self.provisioner.provisioner_type())
            .field("pause_before", &self.pause_before)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Ordered set of provisioners run by the provision step.
#[derive(Clone, Debug, Default)]
pub struct ProvisionHook {
    provisioners: Arc<Vec<HookedProvisioner>>,
}

impl ProvisionHook {
    /// Creates a hook running `provisioners` in order.
    #[must_use]
    pub fn new(provisioners: Vec<HookedProvisioner>) -> Self {
        Self {
            provisioners: Arc::new(provisioners),
        }
    }

    /// Number of provisioners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.provisioners.len()
    }

    /// Returns `true` when there is nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.provisioners.is_empty()
    }

    /// Runs every provisioner in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NoCommunicator`] when provisioners exist but
    /// `comm` is `None`, otherwise the first provisioner failure.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        comm: Option<&dyn Communicator>,
        data: &ProvisionData,
    ) -> Result<(), ProvisionError> {
        if self.provisioners.is_empty() {
            return Ok(());
        }
        let live = comm.ok_or(ProvisionError::NoCommunicator)?;
        let ctx = ProvisionContext {
            cancel,
            ui,
            comm: live,
            data,
        };

        for (index, hooked) in self.provisioners.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            info!(
                index,
                provisioner = hooked.provisioner.provisioner_type(),
                "running provisioner"
            );
            hooked.run(ctx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
