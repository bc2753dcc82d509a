//! Scaleway implementation of the cloud image lifecycle.

mod error;
mod lifecycle;
mod types;

use std::fmt;
use std::time::Duration;

use scaleway_rs::ScalewayApi;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cloud::{
    CloudDriver, CloudFuture, ImageHandle, InstanceHandle, InstanceNetworking, InstanceRequest,
};
use crate::config::ScalewayConfig;

pub use error::{ScalewayBackendError, Stage};

/// Template `type` of the Scaleway builder.
pub const BUILDER_TYPE: &str = "scaleway";

const DEFAULT_SSH_PORT: u16 = 22;
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Driver that builds images through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayDriver {
    api: ScalewayApi,
    config: ScalewayConfig,
    ssh_port: u16,
    poll_interval: Duration,
    wait_timeout: Duration,
    image_timeout: Duration,
}

impl ScalewayDriver {
    /// Constructs a new driver from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the provided configuration
    /// fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            ssh_port: DEFAULT_SSH_PORT,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
            image_timeout: IMAGE_TIMEOUT,
        })
    }
}

impl fmt::Debug for ScalewayDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalewayDriver")
            .field("zone", &self.config.default_zone)
            .field("project", &self.config.default_project_id)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl CloudDriver for ScalewayDriver {
    type Error = ScalewayBackendError;

    fn default_request(&self) -> Result<InstanceRequest, Self::Error> {
        InstanceRequest::builder()
            .image_label(&self.config.default_image)
            .instance_type(&self.config.default_instance_type)
            .zone(&self.config.default_zone)
            .project_id(&self.config.default_project_id)
            .organisation_id(self.config.default_organization_id.clone())
            .architecture(&self.config.default_architecture)
            .build()
            .map_err(ScalewayBackendError::from)
    }

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> CloudFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let image = self.base_image(request).await?;
            let server = self.launch(request, &image).await?;
            let handle = InstanceHandle {
                id: server.id.as_str().to_owned(),
                zone: request.zone.clone(),
            };

            // No step owns the handle yet, so cleanup would never remove it.
            if let Err(err) = self.boot(&handle, &server).await {
                if let Err(cleanup) = self
                    .api
                    .delete_instance_async(&handle.zone, &handle.id)
                    .await
                {
                    warn!(
                        instance = %handle.id,
                        error = %cleanup,
                        "failed to delete unbooted instance"
                    );
                }
                return Err(err);
            }
            info!(instance = %handle.id, %image, "instance powering on");
            Ok(handle)
        })
    }

    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        cancel: &'a CancellationToken,
    ) -> CloudFuture<'a, InstanceNetworking, Self::Error> {
        Box::pin(async move { self.wait_for_public_ip(handle, cancel).await })
    }

    fn is_running<'a>(&'a self, handle: &'a InstanceHandle) -> CloudFuture<'a, bool, Self::Error> {
        Box::pin(async move {
            Ok(self
                .fetch_instance(handle)
                .await?
                .is_some_and(|server| !server.state.is_stopped()))
        })
    }

    fn power_off<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        cancel: &'a CancellationToken,
    ) -> CloudFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let running = self
                .fetch_instance(handle)
                .await?
                .is_some_and(|server| server.state.is_running());
            if running {
                self.api
                    .perform_instance_action_async(&handle.zone, &handle.id, "poweroff")
                    .await?;
            }
            self.wait_until_stopped(handle, cancel).await
        })
    }

    fn create_image<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        name: &'a str,
        cancel: &'a CancellationToken,
    ) -> CloudFuture<'a, ImageHandle, Self::Error> {
        Box::pin(async move {
            let image_id = self.backup(handle, name).await?;
            info!(instance = %handle.id, image = %image_id, "backup started");
            let image = ImageHandle {
                id: image_id,
                name: name.to_owned(),
                zone: handle.zone.clone(),
            };
            if let Err(err) = self.wait_for_image(&image, cancel).await {
                if let Err(cleanup) = self.remove_image(&image).await {
                    warn!(image = %image.id, error = %cleanup, "failed to delete unfinished image");
                }
                return Err(err);
            }
            Ok(image)
        })
    }

    fn delete_image<'a>(&'a self, image: &'a ImageHandle) -> CloudFuture<'a, (), Self::Error> {
        Box::pin(async move { self.remove_image(image).await })
    }

    fn destroy(&self, handle: InstanceHandle) -> CloudFuture<'_, (), Self::Error> {
        Box::pin(async move {
            let Some(server) = self.fetch_instance(&handle).await? else {
                return Ok(());
            };
            if server.state.is_stopped() {
                self.api
                    .delete_instance_async(&handle.zone, &handle.id)
                    .await?;
            } else {
                self.api
                    .perform_instance_action_async(&handle.zone, &handle.id, "terminate")
                    .await?;
            }
            self.wait_until_gone(&handle).await
        })
    }
}
