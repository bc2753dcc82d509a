//! Instance and image lifecycle helpers for the Scaleway driver.

use std::sync::LazyLock;
use std::time::Duration;

use serde::Serialize;

mod backup;
mod launch;
mod wait;

use super::error::Stage;
use super::{ScalewayBackendError, ScalewayDriver};
use crate::retry::RetryError;
use crate::scaleway::types::{Action, InstanceId, InstanceState};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSnapshot {
    pub(crate) id: InstanceId,
    pub(crate) state: InstanceState,
    pub(crate) allowed_actions: Vec<Action>,
    pub(crate) public_ip: Option<String>,
}

impl From<scaleway_rs::ScalewayInstance> for InstanceSnapshot {
    fn from(server: scaleway_rs::ScalewayInstance) -> Self {
        Self {
            id: server.id.into(),
            state: server.state.into(),
            allowed_actions: server
                .allowed_actions
                .into_iter()
                .map(Action::from)
                .collect(),
            public_ip: server.public_ip.map(|ip| ip.address),
        }
    }
}

fn zone_url(zone: &str, path: &str) -> String {
    format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/{path}")
}

/// Maps a finished wait loop onto the driver's error type.
///
/// A timeout keeps the last observed failure when it names a concrete
/// problem, such as a running instance with no public address.
fn from_retry(
    err: RetryError<ScalewayBackendError>,
    stage: Stage,
    id: &str,
) -> ScalewayBackendError {
    match err {
        RetryError::Cancelled { .. } => ScalewayBackendError::Cancelled {
            stage,
            id: id.to_owned(),
        },
        RetryError::Timeout {
            last:
                Some(
                    last @ (ScalewayBackendError::NoPublicAddress { .. }
                    | ScalewayBackendError::StillPresent { .. }),
                ),
            ..
        } => last,
        RetryError::Timeout { .. } => ScalewayBackendError::TimedOut {
            stage,
            id: id.to_owned(),
        },
        RetryError::Aborted { source, .. } => source,
    }
}

impl ScalewayDriver {
    /// Sends a raw Instances API request for an endpoint the SDK does not
    /// wrap, returning the status and body whatever the status.
    async fn send<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<(reqwest::StatusCode, Vec<u8>), ScalewayBackendError> {
        let mut request = HTTP_CLIENT
            .request(method, url)
            .header("X-Auth-Token", &self.config.secret_key);
        if let Some(payload) = body {
            request = request.json(payload);
        }
        let response = request.send().await?;
        let status = response.status();
        Ok((status, response.bytes().await?.to_vec()))
    }

    /// Like [`ScalewayDriver::send`], failing on any non-success status.
    async fn call<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<Vec<u8>, ScalewayBackendError> {
        let (status, bytes) = self.send(method, url, body).await?;
        if status.is_success() {
            return Ok(bytes);
        }
        Err(ScalewayBackendError::Api(format!(
            "{status}: {}",
            String::from_utf8_lossy(&bytes)
        )))
    }
}

#[cfg(test)]
mod tests;
