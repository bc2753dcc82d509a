//! Image builds on disposable cloud instances.
//!
//! A [`CloudDriver`] wraps one provider's API. [`CloudBuilder`] runs the
//! shared sequence on top of it: create an instance, wait for its address,
//! connect, provision, shut down, and capture an image. The image is the
//! build's artifact; the instance is always destroyed during cleanup.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, ArtifactError, ArtifactFuture};
use crate::build::{BuildError, Builder};
use crate::communicator::SshConfig;
use crate::state::{StateBag, StateKey, keys};
use crate::step::Step;
use crate::steps::{
    CommConfig, CommunicatorKind, StepConnect, StepProvision, StepShutdown, load_ssh_settings,
};
use crate::template::duration;

mod steps;

pub use steps::{CloudMachine, StepCreateImage, StepCreateInstance, StepWaitForInstance};

/// Instance created for the running build.
pub const INSTANCE: StateKey<InstanceHandle> = StateKey::new("instance");
/// Image captured from the instance.
pub const IMAGE: StateKey<ImageHandle> = StateKey::new("image");

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Human readable label used for the boot image. The driver resolves this
    /// to a provider specific image identifier.
    pub image_label: String,
    /// Commercial type or flavour to request (for example `DEV1-S`).
    pub instance_type: String,
    /// Target availability zone (for example `fr-par-1`).
    pub zone: String,
    /// Project identifier used for billing and ownership.
    pub project_id: String,
    /// Optional organisation identifier when the provider requires one.
    pub organisation_id: Option<String>,
    /// CPU architecture requested for the instance.
    pub architecture: String,
    /// Cloud-init payload consumed on first boot.
    pub cloud_init_user_data: Option<String>,
}

impl InstanceRequest {
    /// Starts a builder for an [`InstanceRequest`].
    #[must_use]
    pub fn builder() -> InstanceRequestBuilder {
        InstanceRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] when any required field is empty.
    pub fn validate(&self) -> Result<(), RequestError> {
        for (field, value) in [
            ("image_label", &self.image_label),
            ("instance_type", &self.instance_type),
            ("zone", &self.zone),
            ("project_id", &self.project_id),
            ("architecture", &self.architecture),
        ] {
            if value.is_empty() {
                return Err(RequestError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Builder for [`InstanceRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceRequestBuilder {
    image_label: String,
    instance_type: String,
    zone: String,
    project_id: String,
    organisation_id: Option<String>,
    architecture: String,
    cloud_init_user_data: Option<String>,
}

impl InstanceRequestBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing request.
    #[must_use]
    pub fn from_request(request: InstanceRequest) -> Self {
        Self {
            image_label: request.image_label,
            instance_type: request.instance_type,
            zone: request.zone,
            project_id: request.project_id,
            organisation_id: request.organisation_id,
            architecture: request.architecture,
            cloud_init_user_data: request.cloud_init_user_data,
        }
    }

    /// Sets the image label.
    #[must_use]
    pub fn image_label(mut self, value: impl Into<String>) -> Self {
        self.image_label = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the project identifier.
    #[must_use]
    pub fn project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = value.into();
        self
    }

    /// Sets the optional organisation identifier.
    #[must_use]
    pub fn organisation_id(mut self, value: Option<String>) -> Self {
        self.organisation_id = value;
        self
    }

    /// Sets the architecture.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Sets the cloud-init payload.
    #[must_use]
    pub fn cloud_init_user_data(mut self, value: Option<String>) -> Self {
        self.cloud_init_user_data = value;
        self
    }

    /// Builds and validates the [`InstanceRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<InstanceRequest, RequestError> {
        let request = InstanceRequest {
            image_label: self.image_label.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            project_id: self.project_id.trim().to_owned(),
            organisation_id: self.organisation_id.map(|value| value.trim().to_owned()),
            architecture: self.architecture.trim().to_owned(),
            cloud_init_user_data: self.cloud_init_user_data,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Handle returned by a driver once an instance has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Zone in which the instance was created.
    pub zone: String,
}

/// Connection details for reaching an instance once it is ready.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceNetworking {
    /// Public address assigned by the provider.
    pub public_ip: IpAddr,
    /// TCP port for SSH.
    pub ssh_port: u16,
}

/// Image captured from an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageHandle {
    /// Provider specific image identifier.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Zone holding the image.
    pub zone: String,
}

/// Errors raised while assembling an instance request.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by driver operations.
pub type CloudFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Provider operations needed to turn an instance into an image.
pub trait CloudDriver: Send + Sync + 'static {
    /// Provider specific error type returned by the driver.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Request built from the provider's configured defaults.
    ///
    /// # Errors
    ///
    /// Returns the driver error when the defaults are incomplete.
    fn default_request(&self) -> Result<InstanceRequest, Self::Error>;

    /// Creates a new instance and powers it on.
    fn create<'a>(&'a self, request: &'a InstanceRequest)
    -> CloudFuture<'a, InstanceHandle, Self::Error>;

    /// Waits until the instance runs with a public address.
    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        cancel: &'a CancellationToken,
    ) -> CloudFuture<'a, InstanceNetworking, Self::Error>;

    /// Reports whether the instance is still running.
    fn is_running<'a>(&'a self, handle: &'a InstanceHandle) -> CloudFuture<'a, bool, Self::Error>;

    /// Powers the instance off and waits until it has stopped.
    fn power_off<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        cancel: &'a CancellationToken,
    ) -> CloudFuture<'a, (), Self::Error>;

    /// Captures the stopped instance's volumes as an image named `name`.
    ///
    /// Stops waiting when `cancel` fires; an image left half-built is deleted
    /// before the error is returned.
    fn create_image<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        name: &'a str,
        cancel: &'a CancellationToken,
    ) -> CloudFuture<'a, ImageHandle, Self::Error>;

    /// Deletes an image.
    fn delete_image<'a>(&'a self, image: &'a ImageHandle) -> CloudFuture<'a, (), Self::Error>;

    /// Destroys the instance and ensures no provider resources remain.
    fn destroy(&self, handle: InstanceHandle) -> CloudFuture<'_, (), Self::Error>;
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Template settings shared by cloud builders.
///
/// Unset instance fields fall back to the driver's defaults.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CloudConfig {
    /// Boot image label.
    #[serde(default)]
    pub image: Option<String>,
    /// Commercial type.
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Availability zone.
    #[serde(default)]
    pub zone: Option<String>,
    /// Project owning the instance and the image.
    #[serde(default)]
    pub project_id: Option<String>,
    /// CPU architecture.
    #[serde(default)]
    pub architecture: Option<String>,
    /// Inline cloud-init payload.
    #[serde(default)]
    pub user_data: Option<String>,
    /// Local file holding the cloud-init payload.
    #[serde(default)]
    pub user_data_file: Option<Utf8PathBuf>,
    /// Name of the resulting image; `kiln-<build>-<unix time>` when unset.
    #[serde(default)]
    pub image_name: Option<String>,
    /// Command that halts the instance from inside.
    #[serde(default)]
    pub shutdown_command: Option<String>,
    /// How long to wait for `shutdown_command` to stop the instance.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub shutdown_timeout: Duration,
    /// How to reach the instance.
    #[serde(flatten)]
    pub comm: CommConfig,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            image: None,
            instance_type: None,
            zone: None,
            project_id: None,
            architecture: None,
            user_data: None,
            user_data_file: None,
            image_name: None,
            shutdown_command: None,
            shutdown_timeout: default_shutdown_timeout(),
            comm: CommConfig::default(),
        }
    }
}

impl CloudConfig {
    /// Applies the template's overrides to the driver's default request.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] when an override blanks a
    /// required field.
    pub fn request(
        &self,
        base: InstanceRequest,
        user_data: Option<String>,
    ) -> Result<InstanceRequest, RequestError> {
        let mut builder = InstanceRequestBuilder::from_request(base);
        if let Some(image) = &self.image {
            builder = builder.image_label(image);
        }
        if let Some(instance_type) = &self.instance_type {
            builder = builder.instance_type(instance_type);
        }
        if let Some(zone) = &self.zone {
            builder = builder.zone(zone);
        }
        if let Some(project_id) = &self.project_id {
            builder = builder.project_id(project_id);
        }
        if let Some(architecture) = &self.architecture {
            builder = builder.architecture(architecture);
        }
        if user_data.is_some() {
            builder = builder.cloud_init_user_data(user_data);
        }
        builder.build()
    }
}

/// Image captured by a cloud build.
pub struct ImageArtifact<D: CloudDriver> {
    builder_id: String,
    image: ImageHandle,
    driver: Arc<D>,
}

impl<D: CloudDriver> ImageArtifact<D> {
    /// Wraps `image`, deleted through `driver` when destroyed.
    #[must_use]
    pub fn new(builder_id: impl Into<String>, image: ImageHandle, driver: Arc<D>) -> Self {
        Self {
            builder_id: builder_id.into(),
            image,
            driver,
        }
    }
}

impl<D: CloudDriver> fmt::Debug for ImageArtifact<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageArtifact")
            .field("builder_id", &self.builder_id)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl<D: CloudDriver> Artifact for ImageArtifact<D> {
    fn builder_id(&self) -> &str {
        &self.builder_id
    }

    fn id(&self) -> String {
        format!("{}:{}", self.image.zone, self.image.id)
    }

    fn state(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "zone" => Some(self.image.zone.clone().into()),
            "image_name" => Some(self.image.name.clone().into()),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        format!(
            "An image was created: {} ({}) in {}",
            self.image.name, self.image.id, self.image.zone
        )
    }

    fn destroy(&self) -> ArtifactFuture<'_, ()> {
        Box::pin(async move {
            self.driver
                .delete_image(&self.image)
                .await
                .map_err(|err| ArtifactError::Destroy {
                    id: self.id(),
                    message: err.to_string(),
                })
        })
    }
}

/// Builds an image on a transient instance of `driver`'s cloud.
pub struct CloudBuilder<D: CloudDriver> {
    builder_type: &'static str,
    config: CloudConfig,
    driver: Arc<D>,
    ssh: Option<SshConfig>,
}

impl<D: CloudDriver> CloudBuilder<D> {
    /// Creates the builder; SSH settings are loaded by [`Builder::prepare`].
    #[must_use]
    pub const fn new(builder_type: &'static str, config: CloudConfig, driver: Arc<D>) -> Self {
        Self {
            builder_type,
            config,
            driver,
            ssh: None,
        }
    }

    /// Uses `ssh` instead of loading settings from the environment.
    #[must_use]
    pub fn with_ssh_config(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    fn prepare_error(&self, message: impl Into<String>) -> BuildError {
        BuildError::Prepare {
            builder: self.builder_type.to_owned(),
            message: message.into(),
        }
    }
}

impl<D: CloudDriver> fmt::Debug for CloudBuilder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudBuilder")
            .field("builder_type", &self.builder_type)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: CloudDriver> Builder for CloudBuilder<D> {
    fn builder_type(&self) -> &str {
        self.builder_type
    }

    fn prepare(&mut self) -> Result<Vec<String>, BuildError> {
        if self.config.user_data.is_some() && self.config.user_data_file.is_some() {
            return Err(self.prepare_error("only one of user_data or user_data_file may be set"));
        }
        let base = self
            .driver
            .default_request()
            .map_err(|err| self.prepare_error(err.to_string()))?;
        self.config
            .request(base, None)
            .map_err(|err| self.prepare_error(err.to_string()))?;

        let mut warnings = Vec::new();
        match self.config.comm.communicator {
            CommunicatorKind::Ssh if self.ssh.is_none() => {
                self.ssh = load_ssh_settings(&self.config.comm)
                    .map_err(|message| self.prepare_error(message))?;
            }
            CommunicatorKind::Local => warnings.push(String::from(
                "the local communicator provisions this host, not the instance",
            )),
            CommunicatorKind::Ssh | CommunicatorKind::None => {}
        }
        Ok(warnings)
    }

    fn seed(&self, state: &StateBag) -> Result<(), BuildError> {
        state.put(keys::driver::<Arc<D>>(), Arc::clone(&self.driver));
        Ok(())
    }

    fn steps(&self) -> Vec<Box<dyn Step>> {
        let mut steps: Vec<Box<dyn Step>> = vec![
            Box::new(StepCreateInstance::<D>::new(self.config.clone())),
            Box::new(StepWaitForInstance::<D>::new()),
        ];
        if let Some(connect) = StepConnect::from_config(&self.config.comm, self.ssh.as_ref()) {
            steps.push(Box::new(connect));
        }
        steps.push(Box::new(StepProvision));
        steps.push(Box::new(StepShutdown::new(
            self.config.shutdown_command.clone(),
            self.config.shutdown_timeout,
            Arc::new(CloudMachine::new(Arc::clone(&self.driver))),
        )));
        steps.push(Box::new(StepCreateImage::<D>::new(self.config.image_name.clone())));
        steps
    }

    fn artifact(&self, state: &StateBag) -> Result<Option<Box<dyn Artifact>>, BuildError> {
        let image = state
            .get_cloned(IMAGE)
            .ok_or_else(|| BuildError::Artifact(String::from("no image was captured")))?;
        Ok(Some(Box::new(ImageArtifact::new(
            self.builder_type,
            image,
            Arc::clone(&self.driver),
        ))))
    }
}
