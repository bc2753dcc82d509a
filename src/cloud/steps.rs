//! Steps that drive a [`CloudDriver`] through one build.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CloudConfig, CloudDriver, IMAGE, INSTANCE};
use crate::state::{StateBag, keys};
use crate::step::{Action, Step, StepError, StepFuture, halt};
use crate::steps::{MachineControl, MachineError, MachineFuture};
use crate::ui;

fn driver<D: CloudDriver>(state: &StateBag) -> Result<Arc<D>, StepError> {
    state
        .get(keys::driver::<Arc<D>>())
        .map(|driver| Arc::clone(&*driver))
        .ok_or_else(|| StepError::new("cloud", "no cloud driver in the build state"))
}

/// Creates the instance; cleanup destroys it.
pub struct StepCreateInstance<D> {
    config: CloudConfig,
    _driver: PhantomData<fn() -> D>,
}

impl<D: CloudDriver> StepCreateInstance<D> {
    const NAME: &'static str = "create-instance";

    /// Creates the step.
    #[must_use]
    pub const fn new(config: CloudConfig) -> Self {
        Self {
            config,
            _driver: PhantomData,
        }
    }

    async fn user_data(&self) -> Result<Option<String>, StepError> {
        if let Some(path) = &self.config.user_data_file {
            return tokio::fs::read_to_string(path)
                .await
                .map(Some)
                .map_err(|err| StepError::new(Self::NAME, format!("failed to read {path}: {err}")));
        }
        Ok(self.config.user_data.clone())
    }

    async fn create(&self, state: &StateBag) -> Result<(), StepError> {
        let driver = driver::<D>(state)?;
        let user_data = self.user_data().await?;
        let base = driver
            .default_request()
            .map_err(|err| StepError::new(Self::NAME, err))?;
        let request = self
            .config
            .request(base, user_data)
            .map_err(|err| StepError::new(Self::NAME, err))?;

        ui::from_state(state).say(&format!(
            "Creating {} instance in {}...",
            request.instance_type, request.zone
        ));
        let handle = driver
            .create(&request)
            .await
            .map_err(|err| StepError::new(Self::NAME, err))?;
        info!(instance = %handle.id, zone = %handle.zone, "instance created");
        state.put(keys::INSTANCE_ID, handle.id.clone());
        state.put(INSTANCE, handle);
        Ok(())
    }
}

impl<D> std::fmt::Debug for StepCreateInstance<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCreateInstance")
            .field("config", &self.config)
            .finish()
    }
}

impl<D: CloudDriver> Step for StepCreateInstance<D> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a mut self,
        _cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            match self.create(state).await {
                Ok(()) => Action::Continue,
                Err(err) => halt(state, err),
            }
        })
    }

    fn cleanup<'a>(&'a mut self, state: &'a StateBag) -> StepFuture<'a, ()> {
        Box::pin(async move {
            let Some(handle) = state.get_cloned(INSTANCE) else {
                return;
            };
            let Ok(driver) = driver::<D>(state) else {
                return;
            };
            let ui = ui::from_state(state);
            ui.say(&format!("Destroying instance {}...", handle.id));
            let id = handle.id.clone();
            if let Err(err) = driver.destroy(handle).await {
                warn!(instance = %id, error = %err, "failed to destroy instance");
                ui.error(&format!(
                    "Error destroying instance {id}: {err}. Please destroy it manually."
                ));
                return;
            }
            state.remove(INSTANCE);
        })
    }
}

/// Waits for the instance's public address and publishes it as `ssh_host`.
pub struct StepWaitForInstance<D> {
    _driver: PhantomData<fn() -> D>,
}

impl<D: CloudDriver> StepWaitForInstance<D> {
    const NAME: &'static str = "wait-for-instance";

    /// Creates the step.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _driver: PhantomData,
        }
    }
}

impl<D: CloudDriver> Default for StepWaitForInstance<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> std::fmt::Debug for StepWaitForInstance<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StepWaitForInstance")
    }
}

impl<D: CloudDriver> Step for StepWaitForInstance<D> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            let driver = match driver::<D>(state) {
                Ok(driver) => driver,
                Err(err) => return halt(state, err),
            };
            let Some(handle) = state.get_cloned(INSTANCE) else {
                return halt(state, StepError::new(Self::NAME, "no instance was created"));
            };

            ui::from_state(state).say("Waiting for the instance to become ready...");
            let outcome = tokio::select! {
                () = cancel.cancelled() => return Action::Cancel,
                outcome = driver.wait_for_ready(&handle, cancel) => outcome,
            };
            match outcome {
                Ok(networking) => {
                    let host = networking.public_ip.to_string();
                    info!(instance = %handle.id, %host, "instance ready");
                    ui::from_state(state).say(&format!("Instance address: {host}"));
                    state.put(keys::SSH_HOST, host);
                    Action::Continue
                }
                Err(_) if cancel.is_cancelled() => Action::Cancel,
                Err(err) => halt(state, StepError::new(Self::NAME, err)),
            }
        })
    }
}

/// Power control over the build's instance.
pub struct CloudMachine<D> {
    driver: Arc<D>,
}

impl<D: CloudDriver> CloudMachine<D> {
    /// Controls instances through `driver`.
    #[must_use]
    pub const fn new(driver: Arc<D>) -> Self {
        Self { driver }
    }
}

impl<D> std::fmt::Debug for CloudMachine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CloudMachine")
    }
}

impl<D: CloudDriver> MachineControl for CloudMachine<D> {
    fn is_running<'a>(&'a self, state: &'a StateBag) -> MachineFuture<'a, bool> {
        Box::pin(async move {
            let handle = state
                .get_cloned(INSTANCE)
                .ok_or_else(|| MachineError(String::from("no instance was created")))?;
            self.driver
                .is_running(&handle)
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
            let handle = state
                .get_cloned(INSTANCE)
                .ok_or_else(|| MachineError(String::from("no instance was created")))?;
            self.driver
                .power_off(&handle, cancel)
                .await
                .map_err(|err| MachineError(err.to_string()))
        })
    }
}

/// Captures the stopped instance as an image.
///
/// The image survives cleanup unless the build halted or was cancelled.
pub struct StepCreateImage<D> {
    name: Option<String>,
    _driver: PhantomData<fn() -> D>,
}

impl<D: CloudDriver> StepCreateImage<D> {
    const NAME: &'static str = "create-image";

    /// Creates the step; `name` defaults to `kiln-<build>-<unix time>`.
    #[must_use]
    pub const fn new(name: Option<String>) -> Self {
        Self {
            name,
            _driver: PhantomData,
        }
    }

    fn image_name(&self, state: &StateBag) -> String {
        self.name.clone().unwrap_or_else(|| {
            let build = state.get_cloned(keys::BUILD_NAME).unwrap_or_default();
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs());
            format!("kiln-{build}-{stamp}")
        })
    }
}

impl<D> std::fmt::Debug for StepCreateImage<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCreateImage")
            .field("name", &self.name)
            .finish()
    }
}

impl<D: CloudDriver> Step for StepCreateImage<D> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            let driver = match driver::<D>(state) {
                Ok(driver) => driver,
                Err(err) => return halt(state, err),
            };
            let Some(handle) = state.get_cloned(INSTANCE) else {
                return halt(state, StepError::new(Self::NAME, "no instance was created"));
            };
            let name = self.image_name(state);

            ui::from_state(state).say(&format!("Creating image {name}..."));
            match driver.create_image(&handle, &name, cancel).await {
                Ok(image) => {
                    info!(image = %image.id, %name, "image created");
                    state.put(IMAGE, image);
                    Action::Continue
                }
                Err(_) if cancel.is_cancelled() => Action::Cancel,
                Err(err) => halt(state, StepError::new(Self::NAME, err)),
            }
        })
    }

    fn cleanup<'a>(&'a mut self, state: &'a StateBag) -> StepFuture<'a, ()> {
        Box::pin(async move {
            if !state.is_cancelled() && !state.is_halted() {
                return;
            }
            let Some(image) = state.get_cloned(IMAGE) else {
                return;
            };
            let Ok(driver) = driver::<D>(state) else {
                return;
            };
            let ui = ui::from_state(state);
            ui.say(&format!("Deleting image {}...", image.id));
            if let Err(err) = driver.delete_image(&image).await {
                ui.error(&format!("Error deleting image {}: {err}", image.id));
                return;
            }
            state.remove(IMAGE);
        })
    }
}
