//! Types the boot command into the machine's console.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootcommand::{BootCommandError, BootTyper, KeyboardBackend, render_lines};
use crate::state::{StateBag, keys};
use crate::step::{Action, Step, StepError, StepFuture, halt};
use crate::template::TemplateVars;
use crate::ui;

const NAME: &str = "type-boot-command";

/// Opens the keyboard of the machine under construction.
pub type BackendFactory =
    Box<dyn Fn(&StateBag) -> Result<Box<dyn KeyboardBackend>, String> + Send + Sync>;

/// Waits `boot_wait`, renders the boot command and types it.
///
/// Lines may use `{{ .HTTPIP }}`, `{{ .HTTPPort }}` and `{{ .Name }}`, plus
/// any variables the builder adds with [`StepTypeBootCommand::with_var`].
pub struct StepTypeBootCommand {
    lines: Vec<String>,
    boot_wait: Duration,
    vars: TemplateVars,
    typer: Option<BootTyper>,
    factory: BackendFactory,
}

impl StepTypeBootCommand {
    /// Creates the step.
    #[must_use]
    pub fn new(lines: Vec<String>, boot_wait: Duration, factory: BackendFactory) -> Self {
        Self {
            lines,
            boot_wait,
            vars: TemplateVars::new(),
            typer: None,
            factory,
        }
    }

    /// Adds a template variable.
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Types with `typer` instead of one configured from the environment.
    #[must_use]
    pub const fn with_typer(mut self, typer: BootTyper) -> Self {
        self.typer = Some(typer);
        self
    }

    fn vars(&self, state: &StateBag) -> TemplateVars {
        let mut vars = TemplateVars::from([
            (
                String::from("HTTPIP"),
                state.get_cloned(keys::HTTP_IP).unwrap_or_default(),
            ),
            (
                String::from("HTTPPort"),
                state
                    .get_cloned(keys::HTTP_PORT)
                    .map(|port| port.to_string())
                    .unwrap_or_default(),
            ),
            (
                String::from("Name"),
                state
                    .get_cloned(keys::VM_NAME)
                    .or_else(|| state.get_cloned(keys::BUILD_NAME))
                    .unwrap_or_default(),
            ),
        ]);
        vars.extend(self.vars.clone());
        vars
    }
}

impl std::fmt::Debug for StepTypeBootCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepTypeBootCommand")
            .field("lines", &self.lines)
            .field("boot_wait", &self.boot_wait)
            .finish_non_exhaustive()
    }
}

impl Step for StepTypeBootCommand {
    fn name(&self) -> &str {
        NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            if self.lines.is_empty() {
                return Action::Continue;
            }
            let ui = ui::from_state(state);

            if !self.boot_wait.is_zero() {
                ui.say(&format!(
                    "Waiting {} for boot...",
                    humantime::format_duration(self.boot_wait)
                ));
                tokio::select! {
                    () = cancel.cancelled() => return Action::Cancel,
                    () = tokio::time::sleep(self.boot_wait) => {}
                }
            }

            let rendered = match render_lines(&self.lines, &self.vars(state)) {
                Ok(rendered) => rendered,
                Err(err) => return halt(state, StepError::new(NAME, err)),
            };
            let mut backend = match (self.factory)(state) {
                Ok(backend) => backend,
                Err(message) => return halt(state, StepError::new(NAME, message)),
            };

            ui.say("Typing the boot command...");
            let typer = self.typer.unwrap_or_else(BootTyper::from_env);
            match typer.type_lines(&rendered, backend.as_mut(), cancel).await {
                Ok(summary) => {
                    info!(keys = summary.keys, waits = summary.waits, "boot command typed");
                    Action::Continue
                }
                Err(BootCommandError::Cancelled { emitted }) => {
                    info!(emitted, "boot command cancelled");
                    Action::Cancel
                }
                Err(err) => halt(state, StepError::new(NAME, err)),
            }
        })
    }
}
