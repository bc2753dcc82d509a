//! Image capture through the `backup` server action.
//!
//! The SDK does not wrap the backup action or the image endpoints, so these
//! calls go over the raw Instances API.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cloud::{ImageHandle, InstanceHandle};
use crate::retry::{Retry, RetryPolicy, retry};

use super::super::{ScalewayBackendError, ScalewayDriver};
use super::{Stage, from_retry, zone_url};

const IMAGE_PREFIX: &str = "/images/";

#[derive(Serialize)]
struct BackupRequest<'a> {
    action: &'static str,
    name: &'a str,
}

#[derive(Deserialize)]
struct BackupResponse {
    task: BackupTask,
}

#[derive(Deserialize)]
struct BackupTask {
    href_result: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    image: ImageStatus,
}

#[derive(Deserialize)]
struct ImageStatus {
    state: String,
}

/// Extracts the image id from a backup task's `href_result`.
pub(super) fn image_id_from_href(href: &str) -> Option<&str> {
    href.strip_prefix(IMAGE_PREFIX)
        .map(|id| id.trim_end_matches('/'))
        .filter(|id| !id.is_empty())
}

/// Classifies a reported image state for the polling loop.
pub(super) fn image_progress(id: &str, state: &str) -> Result<(), Retry<ScalewayBackendError>> {
    let observed = || ScalewayBackendError::ImageState {
        id: id.to_owned(),
        state: state.to_owned(),
    };
    match state {
        "available" => Ok(()),
        "error" => Err(Retry::Fatal(observed())),
        _ => Err(Retry::Transient(observed())),
    }
}

impl ScalewayDriver {
    /// Starts a backup of the stopped instance and returns the new image id.
    pub(in crate::scaleway) async fn backup(
        &self,
        handle: &InstanceHandle,
        name: &str,
    ) -> Result<String, ScalewayBackendError> {
        let url = zone_url(&handle.zone, &format!("servers/{}/action", handle.id));
        let body = BackupRequest {
            action: "backup",
            name,
        };
        let bytes = self
            .call(reqwest::Method::POST, &url, Some(&body))
            .await?;
        let response: BackupResponse = serde_json::from_slice(&bytes)?;
        image_id_from_href(&response.task.href_result)
            .map(str::to_owned)
            .ok_or_else(|| {
                ScalewayBackendError::Api(format!(
                    "unexpected backup result {}",
                    response.task.href_result
                ))
            })
    }

    async fn image_state(&self, image: &ImageHandle) -> Result<String, ScalewayBackendError> {
        let url = zone_url(&image.zone, &format!("images/{}", image.id));
        let bytes = self.call::<()>(reqwest::Method::GET, &url, None).await?;
        let response: ImageResponse = serde_json::from_slice(&bytes)?;
        Ok(response.image.state)
    }

    /// Polls the image until it is available or `cancel` fires.
    pub(in crate::scaleway) async fn wait_for_image(
        &self,
        image: &ImageHandle,
        cancel: &CancellationToken,
    ) -> Result<(), ScalewayBackendError> {
        let policy = RetryPolicy::new(self.image_timeout, self.poll_interval);
        retry(policy, cancel, |_| async move {
            let state = self.image_state(image).await.map_err(Retry::Fatal)?;
            image_progress(&image.id, &state)
        })
        .await
        .map_err(|err| from_retry(err, Stage::Backup, &image.id))
    }

    /// Deletes the image.
    pub(in crate::scaleway) async fn remove_image(
        &self,
        image: &ImageHandle,
    ) -> Result<(), ScalewayBackendError> {
        let url = zone_url(&image.zone, &format!("images/{}", image.id));
        self.call::<()>(reqwest::Method::DELETE, &url, None).await?;
        Ok(())
    }
}
