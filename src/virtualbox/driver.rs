//! `VBoxManage` invocations used by the VirtualBox builder.

use std::ffi::OsString;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::bootcommand::{BackendFuture, KeyboardError, ScancodeSink};
use crate::process::{CommandError, CommandOutput, CommandRunner};

const PROGRAM: &str = "VBoxManage";
const NO_SNAPSHOTS: &str = "This machine does not have any snapshots";

/// Errors raised while driving VirtualBox.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VirtualBoxError {
    /// `VBoxManage` could not be run or exited unsuccessfully.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The named VM is not registered.
    #[error("virtual machine {0} is not registered")]
    VmNotFound(String),
    /// Every host port in the configured range is taken.
    #[error("no free host port between {min} and {max}")]
    NoFreePort {
        /// Lower bound of the range.
        min: u16,
        /// Upper bound of the range.
        max: u16,
    },
}

/// Thin wrapper over the `VBoxManage` command line.
pub struct VBoxManage {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for VBoxManage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VBoxManage")
    }
}

impl VBoxManage {
    /// Runs `VBoxManage` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn invoke(&self, args: &[&str]) -> Result<CommandOutput, CommandError> {
        debug!(args = %args.join(" "), "running VBoxManage");
        let argv: Vec<OsString> = args.iter().map(OsString::from).collect();
        self.runner.run(PROGRAM, &argv).await
    }

    async fn run(&self, args: &[&str]) -> Result<String, VirtualBoxError> {
        Ok(self.invoke(args).await?.check(PROGRAM)?.stdout)
    }

    /// Reports the `VMState` field of `showvminfo`.
    ///
    /// # Errors
    ///
    /// Returns [`VirtualBoxError::VmNotFound`] when VirtualBox does not know
    /// the VM.
    pub async fn vm_state(&self, vm: &str) -> Result<String, VirtualBoxError> {
        let info = self
            .run(&["showvminfo", vm, "--machinereadable"])
            .await
            .map_err(|err| match err {
                VirtualBoxError::Command(CommandError::Failure { .. }) => {
                    VirtualBoxError::VmNotFound(vm.to_owned())
                }
                other => other,
            })?;
        Ok(machine_readable(&info, "VMState").unwrap_or_default())
    }

    /// A VM that is stopping or paused still counts as running.
    ///
    /// # Errors
    ///
    /// Propagates [`VBoxManage::vm_state`] failures.
    pub async fn is_running(&self, vm: &str) -> Result<bool, VirtualBoxError> {
        let state = self.vm_state(vm).await?;
        Ok(matches!(state.as_str(), "running" | "stopping" | "paused"))
    }

    /// Names of the VM's snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails for another reason than the
    /// VM having no snapshots.
    pub async fn snapshots(&self, vm: &str) -> Result<Vec<String>, VirtualBoxError> {
        let output = self
            .invoke(&["snapshot", vm, "list", "--machinereadable"])
            .await?;
        if output.stdout.contains(NO_SNAPSHOTS) || output.stderr.contains(NO_SNAPSHOTS) {
            return Ok(Vec::new());
        }
        Ok(snapshot_names(&output.check(PROGRAM)?.stdout))
    }

    /// Takes a snapshot named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails.
    pub async fn take_snapshot(&self, vm: &str, name: &str) -> Result<(), VirtualBoxError> {
        self.run(&["snapshot", vm, "take", name]).await.map(drop)
    }

    /// Restores the snapshot named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails.
    pub async fn restore_snapshot(&self, vm: &str, name: &str) -> Result<(), VirtualBoxError> {
        self.run(&["snapshot", vm, "restore", name]).await.map(drop)
    }

    /// Deletes the snapshot named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails.
    pub async fn delete_snapshot(&self, vm: &str, name: &str) -> Result<(), VirtualBoxError> {
        self.run(&["snapshot", vm, "delete", name]).await.map(drop)
    }

    /// Forwards TCP `127.0.0.1:host_port` to `guest_port` on the first NIC.
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails.
    pub async fn forward_port(
        &self,
        vm: &str,
        rule: &str,
        host_port: u16,
        guest_port: u16,
    ) -> Result<(), VirtualBoxError> {
        let spec = format!("{rule},tcp,127.0.0.1,{host_port},,{guest_port}");
        self.run(&["modifyvm", vm, "--natpf1", &spec]).await.map(drop)
    }

    /// Removes a forwarding rule added by [`VBoxManage::forward_port`].
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails.
    pub async fn remove_forward(&self, vm: &str, rule: &str) -> Result<(), VirtualBoxError> {
        self.run(&["modifyvm", vm, "--natpf1", "delete", rule]).await.map(drop)
    }

    /// Starts the VM, without a window when `headless`.
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails.
    pub async fn start(&self, vm: &str, headless: bool) -> Result<(), VirtualBoxError> {
        let kind = if headless { "headless" } else { "gui" };
        self.run(&["startvm", vm, "--type", kind])
            .await
            .map(drop)
    }

    /// Pulls the virtual power cord.
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails.
    pub async fn power_off(&self, vm: &str) -> Result<(), VirtualBoxError> {
        self.run(&["controlvm", vm, "poweroff"]).await.map(drop)
    }

    /// Sends raw keyboard scancodes.
    ///
    /// # Errors
    ///
    /// Returns an error when `VBoxManage` fails.
    pub async fn put_scancodes(&self, vm: &str, codes: &[u8]) -> Result<(), VirtualBoxError> {
        let hex: Vec<String> = codes.iter().map(|code| format!("{code:02x}")).collect();
        let mut args = vec!["controlvm", vm, "keyboardputscancode"];
        args.extend(hex.iter().map(String::as_str));
        self.run(&args).await.map(drop)
    }
}

/// Reads `key="value"` from `--machinereadable` output.
fn machine_readable(info: &str, key: &str) -> Option<String> {
    info.lines().find_map(|line| {
        let (name, value) = line.split_once('=')?;
        (name == key).then(|| value.trim().trim_matches('"').to_owned())
    })
}

fn snapshot_names(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once('=')?;
            name.starts_with("SnapshotName")
                .then(|| value.trim().trim_matches('"').to_owned())
        })
        .collect()
}

/// Chooses the first port in `min..=max` that `is_free` accepts.
pub(crate) fn pick_host_port(min: u16, max: u16, is_free: impl Fn(u16) -> bool) -> Option<u16> {
    (min..=max).find(|port| is_free(*port))
}

/// A port is free when the loopback address can be bound to it.
pub(crate) fn loopback_port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Types into a VM's keyboard with `keyboardputscancode`.
#[derive(Debug)]
pub struct VBoxKeyboard {
    driver: Arc<VBoxManage>,
    vm: String,
}

impl VBoxKeyboard {
    /// Types into `vm`.
    #[must_use]
    pub const fn new(driver: Arc<VBoxManage>, vm: String) -> Self {
        Self { driver, vm }
    }
}

impl ScancodeSink for VBoxKeyboard {
    fn send_scancodes<'a>(&'a mut self, codes: &'a [u8]) -> BackendFuture<'a> {
        Box::pin(async move {
            self.driver
                .put_scancodes(&self.vm, codes)
                .await
                .map_err(|err| KeyboardError(err.to_string()))
        })
    }
}
