//! Steps that drive an existing VirtualBox VM.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::SNAPSHOT;
use super::driver::{VBoxManage, loopback_port_is_free, pick_host_port};
use crate::state::{StateBag, keys};
use crate::step::{Action, Step, StepError, StepFuture, halt};
use crate::steps::{MachineControl, MachineError, MachineFuture};
use crate::ui;

const FORWARD_RULE: &str = "kiln-ssh";
const LOOPBACK: &str = "127.0.0.1";

/// Checks the VM is registered and stopped, then readies its snapshots.
///
/// Publishes `vm_name`.
#[derive(Debug)]
pub struct StepPrepareVm {
    driver: Arc<VBoxManage>,
    vm: String,
    attach_snapshot: Option<String>,
    target_snapshot: Option<String>,
    force_delete_snapshot: bool,
}

impl StepPrepareVm {
    const NAME: &'static str = "prepare-vm";

    /// Creates the step.
    #[must_use]
    pub const fn new(
        driver: Arc<VBoxManage>,
        vm: String,
        attach_snapshot: Option<String>,
        target_snapshot: Option<String>,
        force_delete_snapshot: bool,
    ) -> Self {
        Self {
            driver,
            vm,
            attach_snapshot,
            target_snapshot,
            force_delete_snapshot,
        }
    }

    pub(super) async fn prepare(&self, state: &StateBag) -> Result<(), StepError> {
        let fail = |err: &dyn std::fmt::Display| StepError::new(Self::NAME, err);
        if self.driver.is_running(&self.vm).await.map_err(|err| fail(&err))? {
            return Err(fail(&format!("virtual machine {} is already running", self.vm)));
        }
        let ui = ui::from_state(state);
        if let Some(target) = &self.target_snapshot {
            let existing = self
                .driver
                .snapshots(&self.vm)
                .await
                .map_err(|err| fail(&err))?;
            if existing.contains(target) {
                if !self.force_delete_snapshot {
                    return Err(fail(&format!(
                        "snapshot {target} already exists; set force_delete_snapshot to replace it"
                    )));
                }
                ui.say(&format!("Deleting existing snapshot {target}..."));
                self.driver
                    .delete_snapshot(&self.vm, target)
                    .await
                    .map_err(|err| fail(&err))?;
            }
        }
        if let Some(attach) = &self.attach_snapshot {
            ui.say(&format!("Restoring snapshot {attach}..."));
            self.driver
                .restore_snapshot(&self.vm, attach)
                .await
                .map_err(|err| fail(&err))?;
        }
        state.put(keys::VM_NAME, self.vm.clone());
        Ok(())
    }
}

impl Step for StepPrepareVm {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            let outcome = tokio::select! {
                () = cancel.cancelled() => return Action::Cancel,
                outcome = self.prepare(state) => outcome,
            };
            match outcome {
                Ok(()) => Action::Continue,
                Err(err) => halt(state, err),
            }
        })
    }
}

/// Forwards a free loopback port to the guest's SSH port.
///
/// Publishes `ssh_host` and `ssh_host_port`; cleanup removes the rule.
#[derive(Debug)]
pub struct StepForwardSsh {
    driver: Arc<VBoxManage>,
    port_range: (u16, u16),
    guest_port: u16,
    forwarded: Option<String>,
}

impl StepForwardSsh {
    const NAME: &'static str = "forward-ssh";

    /// Creates the step choosing a host port in `min..=max`.
    #[must_use]
    pub const fn new(driver: Arc<VBoxManage>, min: u16, max: u16, guest_port: u16) -> Self {
        Self {
            driver,
            port_range: (min, max),
            guest_port,
            forwarded: None,
        }
    }

    async fn forward(&mut self, state: &StateBag) -> Result<(), StepError> {
        let vm = state
            .get_cloned(keys::VM_NAME)
            .ok_or_else(|| StepError::new(Self::NAME, "no vm_name in the build state"))?;
        let (min, max) = self.port_range;
        let host_port = pick_host_port(min, max, loopback_port_is_free).ok_or_else(|| {
            StepError::new(Self::NAME, super::VirtualBoxError::NoFreePort { min, max })
        })?;

        ui::from_state(state).say(&format!(
            "Forwarding {LOOPBACK}:{host_port} to guest port {}...",
            self.guest_port
        ));
        self.driver
            .forward_port(&vm, FORWARD_RULE, host_port, self.guest_port)
            .await
            .map_err(|err| StepError::new(Self::NAME, err))?;
        self.forwarded = Some(vm);
        state.put(keys::SSH_HOST, String::from(LOOPBACK));
        state.put(keys::SSH_HOST_PORT, host_port);
        Ok(())
    }
}

impl Step for StepForwardSsh {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a mut self,
        _cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            match self.forward(state).await {
                Ok(()) => Action::Continue,
                Err(err) => halt(state, err),
            }
        })
    }

    fn cleanup<'a>(&'a mut self, _state: &'a StateBag) -> StepFuture<'a, ()> {
        Box::pin(async move {
            let Some(vm) = self.forwarded.take() else {
                return;
            };
            if let Err(err) = self.driver.remove_forward(&vm, FORWARD_RULE).await {
                warn!(%vm, error = %err, "failed to remove port forward");
            }
        })
    }
}

/// Starts the VM; cleanup powers it off if it is still running.
#[derive(Debug)]
pub struct StepRunVm {
    driver: Arc<VBoxManage>,
    headless: bool,
    started: Option<String>,
}

impl StepRunVm {
    const NAME: &'static str = "run-vm";

    /// Creates the step.
    #[must_use]
    pub const fn new(driver: Arc<VBoxManage>, headless: bool) -> Self {
        Self {
            driver,
            headless,
            started: None,
        }
    }
}

impl Step for StepRunVm {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            let Some(vm) = state.get_cloned(keys::VM_NAME) else {
                return halt(state, StepError::new(Self::NAME, "no vm_name in the build state"));
            };
            ui::from_state(state).say(&format!("Starting virtual machine {vm}..."));
            // A start abandoned by cancellation may still have booted the VM.
            self.started = Some(vm.clone());
            let started = tokio::select! {
                () = cancel.cancelled() => return Action::Cancel,
                started = self.driver.start(&vm, self.headless) => started,
            };
            if let Err(err) = started {
                self.started = None;
                return halt(state, StepError::new(Self::NAME, err));
            }
            info!(%vm, headless = self.headless, "virtual machine started");
            Action::Continue
        })
    }

    fn cleanup<'a>(&'a mut self, state: &'a StateBag) -> StepFuture<'a, ()> {
        Box::pin(async move {
            let Some(vm) = self.started.take() else {
                return;
            };
            if !self.driver.is_running(&vm).await.unwrap_or(false) {
                return;
            }
            let ui = ui::from_state(state);
            ui.say(&format!("Stopping virtual machine {vm}..."));
            if let Err(err) = self.driver.power_off(&vm).await {
                ui.error(&format!("Error stopping virtual machine {vm}: {err}"));
            }
        })
    }
}

/// Power control through `VBoxManage`, addressing the VM by `vm_name`.
#[derive(Debug)]
pub struct VBoxMachine {
    driver: Arc<VBoxManage>,
}

impl VBoxMachine {
    /// Controls VMs through `driver`.
    #[must_use]
    pub const fn new(driver: Arc<VBoxManage>) -> Self {
        Self { driver }
    }

    fn vm(state: &StateBag) -> Result<String, MachineError> {
        state
            .get_cloned(keys::VM_NAME)
            .ok_or_else(|| MachineError(String::from("no vm_name in the build state")))
    }
}

impl MachineControl for VBoxMachine {
    fn is_running<'a>(&'a self, state: &'a StateBag) -> MachineFuture<'a, bool> {
        Box::pin(async move {
            let vm = Self::vm(state)?;
            self.driver
                .is_running(&vm)
                .await
                .map_err(|err| MachineError(err.to_string()))
        })
    }

    fn stop<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> MachineFuture<'a, ()> {
        Box::pin(async move {
            let vm = Self::vm(state)?;
            tokio::select! {
                () = cancel.cancelled() => Err(MachineError(String::from("power off cancelled"))),
                stopped = self.driver.power_off(&vm) => {
                    stopped.map_err(|err| MachineError(err.to_string()))
                }
            }
        })
    }
}

/// Takes the target snapshot of the stopped VM and publishes its name.
#[derive(Debug)]
pub struct StepSnapshot {
    driver: Arc<VBoxManage>,
    name: String,
}

impl StepSnapshot {
    const NAME: &'static str = "snapshot";

    /// Creates the step.
    #[must_use]
    pub const fn new(driver: Arc<VBoxManage>, name: String) -> Self {
        Self { driver, name }
    }
}

impl Step for StepSnapshot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            let Some(vm) = state.get_cloned(keys::VM_NAME) else {
                return halt(state, StepError::new(Self::NAME, "no vm_name in the build state"));
            };
            ui::from_state(state).say(&format!("Taking snapshot {}...", self.name));
            let taken = tokio::select! {
                () = cancel.cancelled() => return Action::Cancel,
                taken = self.driver.take_snapshot(&vm, &self.name) => taken,
            };
            match taken {
                Ok(()) => {
                    state.put(SNAPSHOT, self.name.clone());
                    Action::Continue
                }
                Err(err) => halt(state, StepError::new(Self::NAME, err)),
            }
        })
    }
}
