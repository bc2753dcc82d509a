//! Readiness and teardown waits for the Scaleway driver.

use std::net::IpAddr;
use std::str::FromStr;

use tokio_util::sync::CancellationToken;

use crate::cloud::{InstanceHandle, InstanceNetworking};
use crate::retry::{Retry, RetryPolicy, retry};

use super::super::{ScalewayBackendError, ScalewayDriver};
use super::{InstanceSnapshot, Stage, from_retry};

/// Classifies one poll of an instance that should become reachable.
pub(super) fn public_address(
    handle: &InstanceHandle,
    server: Option<&InstanceSnapshot>,
) -> Result<IpAddr, Retry<ScalewayBackendError>> {
    let pending = || ScalewayBackendError::TimedOut {
        stage: Stage::Boot,
        id: handle.id.clone(),
    };
    let Some(snapshot) = server else {
        return Err(Retry::Transient(pending()));
    };
    if !snapshot.state.is_running() {
        return Err(Retry::Transient(pending()));
    }
    snapshot
        .public_ip
        .as_deref()
        .and_then(|ip| IpAddr::from_str(ip).ok())
        .ok_or_else(|| {
            Retry::Transient(ScalewayBackendError::NoPublicAddress {
                id: handle.id.clone(),
            })
        })
}

impl ScalewayDriver {
    pub(in crate::scaleway) async fn fetch_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<InstanceSnapshot>, ScalewayBackendError> {
        let mut servers = self
            .api
            .list_instances(&handle.zone)
            .servers(&handle.id)
            .per_page(1)
            .run_async()
            .await?;
        Ok(servers.pop().map(InstanceSnapshot::from))
    }

    fn wait_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.wait_timeout, self.poll_interval)
    }

    pub(in crate::scaleway) async fn wait_for_public_ip(
        &self,
        handle: &InstanceHandle,
        cancel: &CancellationToken,
    ) -> Result<InstanceNetworking, ScalewayBackendError> {
        let public_ip = retry(self.wait_policy(), cancel, |_| async move {
            let server = self.fetch_instance(handle).await.map_err(Retry::Fatal)?;
            public_address(handle, server.as_ref())
        })
        .await
        .map_err(|err| from_retry(err, Stage::Boot, &handle.id))?;
        Ok(InstanceNetworking {
            public_ip,
            ssh_port: self.ssh_port,
        })
    }

    pub(in crate::scaleway) async fn wait_until_stopped(
        &self,
        handle: &InstanceHandle,
        cancel: &CancellationToken,
    ) -> Result<(), ScalewayBackendError> {
        retry(self.wait_policy(), cancel, |_| async move {
            match self.fetch_instance(handle).await.map_err(Retry::Fatal)? {
                Some(server) if !server.state.is_stopped() => {
                    Err(Retry::Transient(ScalewayBackendError::TimedOut {
                        stage: Stage::PowerOff,
                        id: handle.id.clone(),
                    }))
                }
                _ => Ok(()),
            }
        })
        .await
        .map_err(|err| from_retry(err, Stage::PowerOff, &handle.id))
    }

    /// Polls until the instance has disappeared.
    ///
    /// Teardown runs from step cleanup, which must finish after the build is
    /// cancelled, so only `wait_timeout` bounds this wait.
    pub(in crate::scaleway) async fn wait_until_gone(
        &self,
        handle: &InstanceHandle,
    ) -> Result<(), ScalewayBackendError> {
        let teardown = CancellationToken::new();
        retry(self.wait_policy(), &teardown, |_| async move {
            match self.fetch_instance(handle).await.map_err(Retry::Fatal)? {
                Some(_) => Err(Retry::Transient(ScalewayBackendError::StillPresent {
                    id: handle.id.clone(),
                })),
                None => Ok(()),
            }
        })
        .await
        .map_err(|err| from_retry(err, Stage::Teardown, &handle.id))
    }
}
