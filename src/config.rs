//! Scaleway account settings loaded via `ortho-config`.
//!
//! Templates carry per-build overrides; credentials and account defaults come
//! from `SCW_*` environment variables or the `[scaleway]` table of
//! `kiln.toml`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Scaleway account configuration merged from defaults, configuration files
/// and environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key of the Scaleway application. Not needed for API calls.
    pub access_key: Option<String>,
    /// Secret key used for authentication. Required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project that owns build instances and captured images.
    pub default_project_id: String,
    /// Availability zone used when a template sets none.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type used when a template sets none.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Base image label used when a template sets none.
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

/// Where a required setting can be supplied.
struct Requirement {
    description: &'static str,
    env_var: &'static str,
    key: &'static str,
}

const fn requirement(
    description: &'static str,
    env_var: &'static str,
    key: &'static str,
) -> Requirement {
    Requirement {
        description,
        env_var,
        key,
    }
}

impl ScalewayConfig {
    /// Loads configuration without parsing the process arguments, which
    /// belong to the `kiln` command line.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the sources cannot be merged.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that every required setting is present.
    ///
    /// The message names the environment variable and `kiln.toml` key that
    /// would supply the missing value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for the first blank setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.secret_key,
                requirement("Scaleway API secret key", "SCW_SECRET_KEY", "secret_key"),
            ),
            (
                &self.default_project_id,
                requirement(
                    "Scaleway project ID",
                    "SCW_DEFAULT_PROJECT_ID",
                    "default_project_id",
                ),
            ),
            (
                &self.default_image,
                requirement("base image", "SCW_DEFAULT_IMAGE", "default_image"),
            ),
            (
                &self.default_instance_type,
                requirement(
                    "instance type",
                    "SCW_DEFAULT_INSTANCE_TYPE",
                    "default_instance_type",
                ),
            ),
            (
                &self.default_zone,
                requirement("availability zone", "SCW_DEFAULT_ZONE", "default_zone"),
            ),
            (
                &self.default_architecture,
                requirement(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                ),
            ),
        ];
        match required
            .iter()
            .find(|(value, _)| value.trim().is_empty())
        {
            Some((_, missing)) => Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [scaleway] in kiln.toml",
                missing.description, missing.env_var, missing.key
            ))),
            None => Ok(()),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required setting is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// The `ortho-config` loader failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
