//! The `shell` provisioner: uploads scripts and runs them with a rendered
//! command line.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use shell_escape::unix::escape;
use tracing::debug;
use uuid::Uuid;

use super::{ProvisionContext, ProvisionError, ProvisionFuture, Provisioner};
use crate::communicator::{CommunicatorError, ExitStatus, FileMode, RemoteCmd};
use crate::retry::{Retry, RetryError, RetryPolicy, retry};
use crate::template::{TemplateVars, duration, render};

const TYPE: &str = "shell";
const START_RETRY_POLL: Duration = Duration::from_secs(10);

fn default_execute_command() -> String {
    String::from("chmod +x {{.Path}}; {{.Vars}} {{.Path}}")
}

fn default_inline_shebang() -> String {
    String::from("/bin/sh -e")
}

fn default_remote_folder() -> String {
    String::from("/tmp")
}

fn default_valid_exit_codes() -> Vec<i32> {
    vec![0]
}

const fn default_start_retry_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Template settings of the `shell` provisioner.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ShellConfig {
    /// Commands joined into one script with [`ShellConfig::inline_shebang`].
    #[serde(default)]
    pub inline: Vec<String>,
    /// A single local script.
    #[serde(default)]
    pub script: Option<Utf8PathBuf>,
    /// Local scripts run in order.
    #[serde(default)]
    pub scripts: Vec<Utf8PathBuf>,
    /// `KEY=value` pairs exported to the scripts.
    #[serde(default)]
    pub environment_vars: Vec<String>,
    /// Extra variables as a map.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Command template; `{{.Path}}` and `{{.Vars}}` are substituted.
    #[serde(default = "default_execute_command")]
    pub execute_command: String,
    /// Interpreter line prepended to inline scripts.
    #[serde(default = "default_inline_shebang")]
    pub inline_shebang: String,
    /// Remote directory scripts are uploaded to.
    #[serde(default = "default_remote_folder")]
    pub remote_folder: String,
    /// Remote file name; a random `script_*.sh` name when unset.
    #[serde(default)]
    pub remote_file: Option<String>,
    /// Full remote path; overrides the folder and file settings.
    #[serde(default)]
    pub remote_path: Option<String>,
    /// Exit codes treated as success.
    #[serde(default = "default_valid_exit_codes")]
    pub valid_exit_codes: Vec<i32>,
    /// Treat a dropped connection during a script as success.
    #[serde(default)]
    pub expect_disconnect: bool,
    /// How long to keep retrying uploads and command starts.
    #[serde(
        default = "default_start_retry_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub start_retry_timeout: Duration,
    /// Leave uploaded scripts in place.
    #[serde(default)]
    pub skip_clean: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            inline: Vec::new(),
            script: None,
            scripts: Vec::new(),
            environment_vars: Vec::new(),
            env: BTreeMap::new(),
            execute_command: default_execute_command(),
            inline_shebang: default_inline_shebang(),
            remote_folder: default_remote_folder(),
            remote_file: None,
            remote_path: None,
            valid_exit_codes: default_valid_exit_codes(),
            expect_disconnect: false,
            start_retry_timeout: default_start_retry_timeout(),
            skip_clean: false,
        }
    }
}

/// Where a script's body comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
enum ScriptSource {
    Inline(String),
    File(Utf8PathBuf),
}

impl ScriptSource {
    fn label(&self) -> String {
        match self {
            Self::Inline(_) => String::from("inline script"),
            Self::File(path) => path.to_string(),
        }
    }

    async fn contents(&self) -> Result<Vec<u8>, ProvisionError> {
        match self {
            Self::Inline(body) => Ok(body.clone().into_bytes()),
            Self::File(path) => tokio::fs::read(path)
                .await
                .map_err(|err| ProvisionError::Script {
                    path: path.to_string(),
                    message: err.to_string(),
                }),
        }
    }
}

/// Runs shell scripts on the machine.
#[derive(Clone, Debug)]
pub struct ShellProvisioner {
    config: ShellConfig,
    remote_path: String,
    sources: Vec<ScriptSource>,
    user_env: BTreeMap<String, String>,
}

fn config_error(message: impl Into<String>) -> ProvisionError {
    ProvisionError::Config {
        provisioner: String::from(TYPE),
        message: message.into(),
    }
}

impl ShellProvisioner {
    /// Validates `config` and resolves its defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Config`] when no script source or more than
    /// one kind of source is given, or when an environment entry is not
    /// `KEY=value`.
    pub fn new(config: ShellConfig) -> Result<Self, ProvisionError> {
        let mut kinds = 0;
        let mut sources = Vec::new();
        if !config.inline.is_empty() {
            kinds += 1;
            let mut body = format!("#!{}\n", config.inline_shebang);
            for line in &config.inline {
                body.push_str(line);
                body.push('\n');
            }
            sources.push(ScriptSource::Inline(body));
        }
        if let Some(path) = &config.script {
            kinds += 1;
            sources.push(ScriptSource::File(path.clone()));
        }
        if !config.scripts.is_empty() {
            kinds += 1;
            sources.extend(config.scripts.iter().cloned().map(ScriptSource::File));
        }
        match kinds {
            0 => return Err(config_error("one of inline, script or scripts must be set")),
            1 => {}
            _ => return Err(config_error("only one of inline, script or scripts may be set")),
        }
        if config.valid_exit_codes.is_empty() {
            return Err(config_error("valid_exit_codes must not be empty"));
        }

        let mut user_env = config.env.clone();
        for entry in &config.environment_vars {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(config_error(format!(
                    "environment variable {entry:?} is not in KEY=value form"
                )));
            };
            if key.trim().is_empty() {
                return Err(config_error(format!(
                    "environment variable {entry:?} has an empty name"
                )));
            }
            user_env.insert(key.to_owned(), value.to_owned());
        }

        let remote_path = config.remote_path.clone().unwrap_or_else(|| {
            let file = config
                .remote_file
                .clone()
                .unwrap_or_else(|| format!("script_{}.sh", Uuid::new_v4().simple()));
            format!("{}/{file}", config.remote_folder.trim_end_matches('/'))
        });

        Ok(Self {
            config,
            remote_path,
            sources,
            user_env,
        })
    }

    /// Remote path every script is uploaded to.
    #[must_use]
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Renders `{{.Vars}}`: sorted `KEY='value'` pairs, user values
    /// overridden by the build's `PACKER_*` facts.
    #[must_use]
    pub fn flattened_env(&self, build: &[(String, String)]) -> String {
        let mut vars = self.user_env.clone();
        vars.extend(build.iter().cloned());
        vars.iter()
            .map(|(key, value)| format!("{key}='{}'", value.replace('\'', "'\"'\"'")))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command_line(&self, env: &str) -> Result<String, ProvisionError> {
        let vars = TemplateVars::from([
            (String::from("Path"), escape(self.remote_path.as_str().into()).into_owned()),
            (String::from("Vars"), env.to_owned()),
        ]);
        render(&self.config.execute_command, &vars).map_err(|source| ProvisionError::Render {
            field: String::from("execute_command"),
            source,
        })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.start_retry_timeout, START_RETRY_POLL)
    }

    async fn upload(&self, ctx: ProvisionContext<'_>, body: &[u8]) -> Result<(), ProvisionError> {
        let outcome = retry(self.retry_policy(), ctx.cancel, |attempt| async move {
            let mut reader = body;
            ctx.comm
                .upload(&self.remote_path, &mut reader, FileMode::EXECUTABLE)
                .await
                .map_err(|err| {
                    debug!(attempt, error = %err, "script upload failed");
                    Retry::Transient(err)
                })
        })
        .await;
        self.retry_result("upload", outcome)
    }

    /// Starts `command`, retrying start failures, and waits for it.
    async fn start(
        &self,
        ctx: ProvisionContext<'_>,
        command: &str,
    ) -> Result<RemoteCmd, ProvisionError> {
        let outcome = retry(self.retry_policy(), ctx.cancel, |_| async move {
            let mut cmd = RemoteCmd::new(command);
            let started = ctx.comm.start(ctx.cancel, &mut cmd).await;
            started.map(|()| cmd).map_err(Retry::Transient)
        })
        .await;
        let mut cmd = self.retry_result("start", outcome)?;
        cmd.wait().await;
        for line in cmd.stdout().lines() {
            ctx.ui.message(line);
        }
        for line in cmd.stderr().lines() {
            ctx.ui.error(line);
        }
        Ok(cmd)
    }

    fn retry_result<T>(
        &self,
        action: &str,
        outcome: Result<T, RetryError<CommunicatorError>>,
    ) -> Result<T, ProvisionError> {
        outcome.map_err(|err| match err {
            RetryError::Cancelled { .. } => ProvisionError::Cancelled,
            RetryError::Aborted { source, .. } => ProvisionError::Communicator(source),
            RetryError::Timeout { last, .. } => ProvisionError::RetryTimeout {
                action: format!("{action} of {}", self.remote_path),
                timeout: self.config.start_retry_timeout,
                message: last.map_or_else(
                    || String::from("no attempt completed"),
                    |err| err.to_string(),
                ),
            },
        })
    }

    async fn run_script(
        &self,
        ctx: ProvisionContext<'_>,
        source: &ScriptSource,
        env: &str,
    ) -> Result<(), ProvisionError> {
        ctx.ui
            .say(&format!("Provisioning with shell script: {}", source.label()));
        let body = source.contents().await?;
        self.upload(ctx, &body).await?;

        let command = self.command_line(env)?;
        let cmd = self.start(ctx, &command).await?;
        match cmd.exit_status() {
            ExitStatus::Exited(code) if self.config.valid_exit_codes.contains(&code) => {}
            ExitStatus::Exited(code) => {
                return Err(ProvisionError::ExitCode {
                    script: self.remote_path.clone(),
                    code,
                    valid: self.config.valid_exit_codes.clone(),
                });
            }
            ExitStatus::Disconnected | ExitStatus::NotStarted if self.config.expect_disconnect => {
                ctx.ui
                    .say("Remote end disconnected as expected; skipping script cleanup");
                return Ok(());
            }
            ExitStatus::Disconnected | ExitStatus::NotStarted => {
                if ctx.cancel.is_cancelled() {
                    return Err(ProvisionError::Cancelled);
                }
                return Err(ProvisionError::Disconnected {
                    script: self.remote_path.clone(),
                });
            }
        }

        if !self.config.skip_clean {
            let remove = format!("rm -f {}", escape(self.remote_path.as_str().into()));
            let cleanup = self.start(ctx, &remove).await?;
            if cleanup.exit_status() != ExitStatus::Exited(0) {
                return Err(ProvisionError::ExitCode {
                    script: remove,
                    code: cleanup.exit_status().code().unwrap_or(-1),
                    valid: vec![0],
                });
            }
        }
        Ok(())
    }
}

impl Provisioner for ShellProvisioner {
    fn provisioner_type(&self) -> &str {
        TYPE
    }

    fn provision<'a>(&'a self, ctx: ProvisionContext<'a>) -> ProvisionFuture<'a> {
        Box::pin(async move {
            let env = self.flattened_env(&ctx.data.environment());
            for source in &self.sources {
                self.run_script(ctx, source, &env).await?;
            }
            Ok(())
        })
    }
}
