//! Builder that provisions an existing VirtualBox VM and snapshots it.
//!
//! The VM must already be registered. The build optionally restores an
//! `attach_snapshot`, forwards a loopback port to the guest's SSH port,
//! boots the VM, types the boot command, provisions over the communicator,
//! shuts the VM down and takes `target_snapshot`.

mod driver;
mod steps;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

pub use driver::{VBoxKeyboard, VBoxManage, VirtualBoxError};
pub use steps::{StepForwardSsh, StepPrepareVm, StepRunVm, StepSnapshot, VBoxMachine};

use crate::artifact::{Artifact, ArtifactError, ArtifactFuture};
use crate::bootcommand::{KeyboardBackend, ScancodeBackend};
use crate::build::{BuildError, Builder};
use crate::communicator::SshConfig;
use crate::process::CommandRunner;
use crate::state::{StateBag, StateKey, keys};
use crate::step::Step;
use crate::steps::{
    BackendFactory, CommConfig, CommunicatorKind, StepConnect, StepProvision, StepShutdown,
    StepTypeBootCommand, load_ssh_settings,
};
use crate::template::duration;

/// Template `type` of the VirtualBox builder.
pub const BUILDER_TYPE: &str = "virtualbox-vm";

/// Name of the snapshot taken by the build.
pub const SNAPSHOT: StateKey<String> = StateKey::new("snapshot");

const DEFAULT_GUEST_SSH_PORT: u16 = 22;

const fn default_port_min() -> u16 {
    2222
}

const fn default_port_max() -> u16 {
    4444
}

const fn default_headless() -> bool {
    true
}

const fn default_boot_wait() -> Duration {
    Duration::from_secs(10)
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Template settings for the `virtualbox-vm` builder.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct VirtualBoxVmConfig {
    /// Registered VM to drive.
    pub vm_name: String,
    /// Start without a console window.
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Lines typed into the console after `boot_wait`.
    #[serde(default)]
    pub boot_command: Vec<String>,
    /// Delay between starting the VM and typing.
    #[serde(default = "default_boot_wait", deserialize_with = "duration::deserialize")]
    pub boot_wait: Duration,
    /// Lowest host port considered for the SSH forward.
    #[serde(default = "default_port_min")]
    pub ssh_host_port_min: u16,
    /// Highest host port considered for the SSH forward.
    #[serde(default = "default_port_max")]
    pub ssh_host_port_max: u16,
    /// Command that shuts the guest down cleanly.
    #[serde(default)]
    pub shutdown_command: Option<String>,
    /// Time allowed for `shutdown_command` to stop the VM.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub shutdown_timeout: Duration,
    /// Snapshot restored before the VM starts.
    #[serde(default)]
    pub attach_snapshot: Option<String>,
    /// Snapshot taken once the VM is stopped; becomes the artifact.
    #[serde(default)]
    pub target_snapshot: Option<String>,
    /// Replace an existing `target_snapshot` instead of failing.
    #[serde(default)]
    pub force_delete_snapshot: bool,
    /// How to reach the guest.
    #[serde(flatten)]
    pub comm: CommConfig,
}

impl VirtualBoxVmConfig {
    fn forwards_ssh(&self) -> bool {
        self.comm.communicator == CommunicatorKind::Ssh && self.comm.ssh_host.is_none()
    }
}

/// A snapshot of a VirtualBox VM.
#[derive(Debug)]
pub struct SnapshotArtifact {
    driver: Arc<VBoxManage>,
    vm: String,
    snapshot: String,
}

impl SnapshotArtifact {
    /// Wraps `snapshot` of `vm`.
    #[must_use]
    pub const fn new(driver: Arc<VBoxManage>, vm: String, snapshot: String) -> Self {
        Self {
            driver,
            vm,
            snapshot,
        }
    }
}

impl Artifact for SnapshotArtifact {
    fn builder_id(&self) -> &str {
        BUILDER_TYPE
    }

    fn id(&self) -> String {
        format!("{}:{}", self.vm, self.snapshot)
    }

    fn state(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "vm_name" => Some(serde_json::Value::from(self.vm.as_str())),
            "snapshot" => Some(serde_json::Value::from(self.snapshot.as_str())),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        format!("Snapshot {} of VM {}", self.snapshot, self.vm)
    }

    fn destroy(&self) -> ArtifactFuture<'_, ()> {
        Box::pin(async move {
            self.driver
                .delete_snapshot(&self.vm, &self.snapshot)
                .await
                .map_err(|err| ArtifactError::Destroy {
                    id: self.id(),
                    message: err.to_string(),
                })
        })
    }
}

/// Boots, provisions and snapshots an existing VirtualBox VM.
#[derive(Debug)]
pub struct VirtualBoxVmBuilder {
    config: VirtualBoxVmConfig,
    driver: Arc<VBoxManage>,
    ssh: Option<SshConfig>,
}

impl VirtualBoxVmBuilder {
    /// Creates the builder; `VBoxManage` runs through `runner`.
    #[must_use]
    pub fn new(config: VirtualBoxVmConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            driver: Arc::new(VBoxManage::new(runner)),
            ssh: None,
        }
    }

    /// Uses `ssh` instead of loading settings from the environment.
    #[must_use]
    pub fn with_ssh_config(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    fn keyboard(&self) -> BackendFactory {
        let driver = Arc::clone(&self.driver);
        Box::new(move |state: &StateBag| {
            let vm = state
                .get_cloned(keys::VM_NAME)
                .ok_or_else(|| String::from("no vm_name in the build state"))?;
            let keyboard = VBoxKeyboard::new(Arc::clone(&driver), vm);
            Ok(Box::new(ScancodeBackend::new(keyboard)) as Box<dyn KeyboardBackend>)
        })
    }
}

impl Builder for VirtualBoxVmBuilder {
    fn builder_type(&self) -> &str {
        BUILDER_TYPE
    }

    fn prepare(&mut self) -> Result<Vec<String>, BuildError> {
        let prepare_error = |message: String| BuildError::Prepare {
            builder: String::from(BUILDER_TYPE),
            message,
        };
        let config = &self.config;
        let mut warnings = Vec::new();

        if config.vm_name.trim().is_empty() {
            return Err(prepare_error(String::from("vm_name must be set")));
        }
        if config.ssh_host_port_min == 0 || config.ssh_host_port_min > config.ssh_host_port_max {
            return Err(prepare_error(format!(
                "ssh_host_port_min ({}) must be positive and not above ssh_host_port_max ({})",
                config.ssh_host_port_min, config.ssh_host_port_max
            )));
        }
        if config.attach_snapshot.is_some() && config.attach_snapshot == config.target_snapshot {
            return Err(prepare_error(String::from(
                "attach_snapshot and target_snapshot must differ",
            )));
        }
        if config.target_snapshot.is_none() {
            warnings.push(String::from(
                "target_snapshot is not set; the build will produce no artifact",
            ));
        }
        match config.comm.communicator {
            CommunicatorKind::Ssh if self.ssh.is_none() => {
                self.ssh = load_ssh_settings(&config.comm).map_err(prepare_error)?;
            }
            CommunicatorKind::Ssh | CommunicatorKind::Local => {}
            CommunicatorKind::None => warnings.push(String::from(
                "communicator is none; provisioners will fail if any apply to this build",
            )),
        }
        Ok(warnings)
    }

    fn steps(&self) -> Vec<Box<dyn Step>> {
        let config = &self.config;
        let driver = &self.driver;
        let mut steps: Vec<Box<dyn Step>> = vec![Box::new(StepPrepareVm::new(
            Arc::clone(driver),
            config.vm_name.clone(),
            config.attach_snapshot.clone(),
            config.target_snapshot.clone(),
            config.force_delete_snapshot,
        ))];
        if config.forwards_ssh() {
            steps.push(Box::new(StepForwardSsh::new(
                Arc::clone(driver),
                config.ssh_host_port_min,
                config.ssh_host_port_max,
                config.comm.ssh_port.unwrap_or(DEFAULT_GUEST_SSH_PORT),
            )));
        }
        steps.push(Box::new(StepRunVm::new(Arc::clone(driver), config.headless)));
        steps.push(Box::new(StepTypeBootCommand::new(
            config.boot_command.clone(),
            config.boot_wait,
            self.keyboard(),
        )));
        if let Some(connect) = StepConnect::from_config(&config.comm, self.ssh.as_ref()) {
            steps.push(Box::new(connect));
        }
        steps.push(Box::new(StepProvision));
        steps.push(Box::new(StepShutdown::new(
            config.shutdown_command.clone(),
            config.shutdown_timeout,
            Arc::new(VBoxMachine::new(Arc::clone(driver))),
        )));
        if let Some(target) = &config.target_snapshot {
            steps.push(Box::new(StepSnapshot::new(Arc::clone(driver), target.clone())));
        }
        steps
    }

    fn artifact(&self, state: &StateBag) -> Result<Option<Box<dyn Artifact>>, BuildError> {
        let Some(snapshot) = state.get_cloned(SNAPSHOT) else {
            return Ok(None);
        };
        Ok(Some(Box::new(SnapshotArtifact::new(
            Arc::clone(&self.driver),
            self.config.vm_name.clone(),
            snapshot,
        ))))
    }
}

#[cfg(test)]
mod tests;
