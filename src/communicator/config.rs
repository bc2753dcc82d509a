//! SSH client settings shared by every SSH-connected build.
//!
//! Loaded via `ortho-config`, which merges defaults, configuration files and
//! `KILN_SSH_*` environment variables. Per-build values such as the user
//! name come from the template and override [`SshConfig::ssh_user`].

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Settings for the system `ssh` and `rsync` clients.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN_SSH",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `rsync` executable used for directory transfers.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// User to connect as when the template does not name one.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Whether to force batch mode so SSH never prompts for a password.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; build machines are ephemeral so
    /// this defaults to off.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key used for authentication. Supports a leading `~/`.
    pub ssh_identity_file: Option<String>,
    /// Seconds `ssh` waits for the TCP connection before giving up.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout: u64,
}

/// Errors raised when loading the SSH configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SshConfigLoadError {
    /// Parsing or merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
    /// A required value is blank.
    #[error(
        "missing {field}: set KILN_SSH_{env_suffix} or add {field} to [ssh] in kiln.toml",
        env_suffix = field.to_uppercase()
    )]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
}

impl SshConfig {
    /// Loads configuration from defaults, configuration files and the
    /// environment without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| SshConfigLoadError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigLoadError::InvalidConfig`] naming the blank field.
    pub fn validate(&self) -> Result<(), SshConfigLoadError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.rsync_bin, "rsync_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SshConfigLoadError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(SshConfigLoadError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), SshConfigLoadError> {
        Self::require_optional_value(Some(value), field)
    }
}

/// Expands a leading `~/` to the user's home directory.
///
/// The path is returned unchanged when `HOME` is unset.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
