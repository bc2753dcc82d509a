//! Failures of the Scaleway driver, named after the build stage that hit them.

use std::fmt;

use scaleway_rs::ScalewayError;
use thiserror::Error;

use crate::cloud::RequestError;
use crate::config::ConfigError;

/// Driver wait that can run out of time or be cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Instance booting until it has a public address.
    Boot,
    /// Instance powering off before the backup.
    PowerOff,
    /// Backup image becoming available.
    Backup,
    /// Instance disappearing after termination.
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Boot => "boot",
            Self::PowerOff => "power off",
            Self::Backup => "image backup",
            Self::Teardown => "teardown",
        })
    }
}

/// Errors raised by the Scaleway driver.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Credentials or defaults are unusable.
    #[error("invalid scaleway settings: {0}")]
    Config(String),
    /// The instance request is incomplete.
    #[error(transparent)]
    Request(#[from] RequestError),
    /// No image carries the base image label.
    #[error("no available {arch} image labelled '{label}' in {zone}")]
    NoBaseImage {
        /// Label the template asked for.
        label: String,
        /// Required architecture.
        arch: String,
        /// Zone searched.
        zone: String,
    },
    /// The zone rejected the commercial type.
    #[error("{zone} does not offer instance type {instance_type}")]
    InstanceTypeUnavailable {
        /// Requested commercial type.
        instance_type: String,
        /// Target zone.
        zone: String,
    },
    /// The new server neither runs nor allows `poweron`.
    #[error("instance {id} is {state} and cannot be powered on")]
    CannotPowerOn {
        /// Server id.
        id: String,
        /// State reported by the API.
        state: String,
    },
    /// The server runs without a public IPv4 address.
    #[error("instance {id} has no public IPv4 address")]
    NoPublicAddress {
        /// Server id.
        id: String,
    },
    /// The server is still listed after teardown.
    #[error("instance {id} still exists after teardown")]
    StillPresent {
        /// Server id.
        id: String,
    },
    /// The backup image is not available yet, or failed.
    #[error("image {id} is {state}")]
    ImageState {
        /// Image id.
        id: String,
        /// State reported by the API.
        state: String,
    },
    /// A wait ran past its deadline.
    #[error("{stage} of {id} did not finish in time")]
    TimedOut {
        /// Wait that expired.
        stage: Stage,
        /// Server or image id.
        id: String,
    },
    /// The build was cancelled during a wait.
    #[error("{stage} of {id} was cancelled")]
    Cancelled {
        /// Wait that was abandoned.
        stage: Stage,
        /// Server or image id.
        id: String,
    },
    /// The API or its transport failed.
    #[error("scaleway API: {0}")]
    Api(String),
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        Self::Api(value.to_string())
    }
}

impl From<reqwest::Error> for ScalewayBackendError {
    fn from(value: reqwest::Error) -> Self {
        Self::Api(value.to_string())
    }
}

impl From<serde_json::Error> for ScalewayBackendError {
    fn from(value: serde_json::Error) -> Self {
        Self::Api(format!("unexpected response: {value}"))
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
