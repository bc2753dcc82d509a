//! Launching the build instance from a labelled base image.
//!
//! The server is created stopped so its cloud-init user data is in place
//! before first boot, then powered on.

use scaleway_rs::{ScalewayApiError, ScalewayImage, ScalewayListInstanceImagesBuilder};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cloud::{InstanceHandle, InstanceRequest};

use super::super::{ScalewayBackendError, ScalewayDriver};
use super::{InstanceSnapshot, zone_url};

/// Tags marking servers a build owns, so stray ones can be found.
pub(super) const BUILD_TAGS: [&str; 2] = ["kiln", "ephemeral"];

#[derive(Debug, Serialize)]
pub(super) struct NewServer<'a> {
    name: String,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
    tags: [&'static str; 2],
    dynamic_ip_required: bool,
    routed_ip_enabled: bool,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init: Option<&'a str>,
}

impl<'a> NewServer<'a> {
    pub(super) fn stopped(request: &'a InstanceRequest, image: &'a str) -> Self {
        Self {
            name: format!("kiln-{}", Uuid::new_v4().simple()),
            commercial_type: &request.instance_type,
            image,
            project: &request.project_id,
            organization: request.organisation_id.as_deref(),
            tags: BUILD_TAGS,
            dynamic_ip_required: true,
            routed_ip_enabled: true,
            stopped: true,
            cloud_init: request.cloud_init_user_data.as_deref(),
        }
    }
}

#[derive(Deserialize)]
struct Created {
    server: scaleway_rs::ScalewayInstance,
}

/// Newest available image of the requested architecture.
pub(super) fn newest_image(
    images: Vec<ScalewayImage>,
    request: &InstanceRequest,
) -> Result<String, ScalewayBackendError> {
    images
        .into_iter()
        .filter(|image| image.arch == request.architecture && image.state == "available")
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
        .ok_or_else(|| ScalewayBackendError::NoBaseImage {
            label: request.image_label.clone(),
            arch: request.architecture.clone(),
            zone: request.zone.clone(),
        })
}

/// The API names either the field or the offending value.
pub(super) fn rejects_instance_type(api_err: &ScalewayApiError, instance_type: &str) -> bool {
    api_err.resource.as_deref() == Some("commercial_type")
        || api_err.resource_id.as_deref() == Some(instance_type)
        || (api_err.etype == "invalid_arguments"
            && api_err.message.to_ascii_lowercase().contains("commercial_type"))
}

/// What a freshly created server needs before it can boot.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Boot {
    Running,
    PowerOn,
}

pub(super) fn boot_plan(server: &InstanceSnapshot) -> Result<Boot, ScalewayBackendError> {
    if server.state.is_running() {
        return Ok(Boot::Running);
    }
    if server.allowed_actions.iter().any(|action| action.as_str() == "poweron") {
        return Ok(Boot::PowerOn);
    }
    Err(ScalewayBackendError::CannotPowerOn {
        id: server.id.as_str().to_owned(),
        state: server.state.as_str().to_owned(),
    })
}

impl ScalewayDriver {
    /// Resolves the request's image label in its zone.
    pub(in crate::scaleway) async fn base_image(
        &self,
        request: &InstanceRequest,
    ) -> Result<String, ScalewayBackendError> {
        let images = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &request.zone)
            .name(&request.image_label)
            .arch(&request.architecture)
            .run_async()
            .await?;
        newest_image(images, request)
    }

    /// Creates the build server, stopped, from `image`.
    pub(in crate::scaleway) async fn launch(
        &self,
        request: &InstanceRequest,
        image: &str,
    ) -> Result<InstanceSnapshot, ScalewayBackendError> {
        let url = zone_url(&request.zone, "servers");
        let payload = NewServer::stopped(request, image);
        let (status, body) = self
            .send(reqwest::Method::POST, &url, Some(&payload))
            .await?;
        if status.is_success() {
            let created: Created = serde_json::from_slice(&body)?;
            return Ok(InstanceSnapshot::from(created.server));
        }

        let unavailable = serde_json::from_slice::<ScalewayApiError>(&body)
            .is_ok_and(|api_err| rejects_instance_type(&api_err, &request.instance_type));
        if unavailable {
            return Err(ScalewayBackendError::InstanceTypeUnavailable {
                instance_type: request.instance_type.clone(),
                zone: request.zone.clone(),
            });
        }
        Err(ScalewayBackendError::Api(format!(
            "{status}: {}",
            String::from_utf8_lossy(&body)
        )))
    }

    /// Powers on `server` unless it already runs.
    pub(in crate::scaleway) async fn boot(
        &self,
        handle: &InstanceHandle,
        server: &InstanceSnapshot,
    ) -> Result<(), ScalewayBackendError> {
        if boot_plan(server)? == Boot::PowerOn {
            self.api
                .perform_instance_action_async(&handle.zone, &handle.id, "poweron")
                .await?;
        }
        Ok(())
    }
}
