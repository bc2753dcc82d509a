//! Binary entry point for the `kiln` CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kiln::artifact::{Artifact, publish};
use kiln::build::{Build, BuildError};
use kiln::runner::{DebugPause, PauseLocation};
use kiln::state::StateBag;
use kiln::step::StepFuture;
use kiln::template::{Template, TemplateError};
use kiln::ui::{ConsoleUi, SharedUi};

use cli::{BuildCommand, Cli, Command, ValidateCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("template is invalid:\n{0}")]
    Invalid(String),
    #[error("{failed} of {total} build(s) did not succeed")]
    Builds { failed: usize, total: usize },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            trigger.cancel();
        }
    });

    let exit_code = match dispatch(cli.command, &cancel).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(command: Command, cancel: &CancellationToken) -> Result<(), CliError> {
    match command {
        Command::Validate(args) => validate(&args),
        Command::Build(args) => build(args, cancel).await,
    }
}

/// Prepares every build, printing warnings; returns the errors joined.
fn prepare_all(builds: &mut [Build], mut out: impl Write) -> Result<(), CliError> {
    let mut errors = Vec::new();
    for build in builds {
        match build.prepare() {
            Ok(warnings) => {
                for warning in warnings {
                    writeln!(out, "Warning ({}): {warning}", build.name()).ok();
                }
            }
            Err(err) => errors.push(format!("* {}: {err}", build.name())),
        }
    }
    if errors.is_empty() {
        return Ok(());
    }
    Err(CliError::Invalid(errors.join("\n")))
}

fn validate(args: &ValidateCommand) -> Result<(), CliError> {
    let template = Template::load(Utf8Path::new(&args.template))?;
    let mut builds = template.builds(&[], &[])?;
    prepare_all(&mut builds, io::stdout())?;
    writeln!(io::stdout(), "Template validated successfully.").ok();
    Ok(())
}

async fn build(args: BuildCommand, cancel: &CancellationToken) -> Result<(), CliError> {
    let template = Template::load(Utf8Path::new(&args.template))?;
    let mut builds = template.builds(&args.only, &args.except)?;
    prepare_all(&mut builds, io::stdout())?;

    let pause: Option<Arc<dyn DebugPause>> = args
        .debug
        .then(|| Arc::new(PromptPause) as Arc<dyn DebugPause>);
    let total = builds.len();
    let mut failed = 0;
    let mut finished: Vec<(String, Vec<Box<dyn Artifact>>)> = Vec::new();

    for planned in builds {
        let current = match &pause {
            Some(hook) => planned.with_pause(Arc::clone(hook)),
            None => planned,
        };
        match run_one(&current, cancel).await {
            Some(artifacts) => finished.push((current.name().to_owned(), artifacts)),
            None => failed += 1,
        }
    }

    write_summary(io::stdout(), &finished);
    if failed == 0 {
        return Ok(());
    }
    Err(CliError::Builds { failed, total })
}

/// Runs one build and publishes its artifact; `None` marks a failure.
async fn run_one(build: &Build, cancel: &CancellationToken) -> Option<Vec<Box<dyn Artifact>>> {
    let ui: SharedUi = Arc::new(ConsoleUi::new(build.name()));
    let artifact = match build.run(cancel, Arc::clone(&ui)).await {
        Ok(Some(artifact)) => artifact,
        Ok(None) => return Some(Vec::new()),
        Err(BuildError::Cancelled) => {
            ui.error("Build was cancelled.");
            return None;
        }
        Err(err) => {
            ui.error(&format!("Build errored: {err}"));
            return None;
        }
    };
    match publish(
        cancel,
        ui.as_ref(),
        build.name(),
        artifact,
        build.post_processors(),
        false,
    )
    .await
    {
        Ok(artifacts) => Some(artifacts),
        Err(err) => {
            ui.error(&format!("Post-processing failed: {err}"));
            None
        }
    }
}

fn write_summary(mut target: impl Write, finished: &[(String, Vec<Box<dyn Artifact>>)]) {
    if finished.is_empty() {
        return;
    }
    writeln!(target, "\n==> Builds finished. The artifacts of successful builds are:").ok();
    for (name, artifacts) in finished {
        if artifacts.is_empty() {
            writeln!(target, "--> {name}: no artifacts were created").ok();
        }
        for artifact in artifacts {
            writeln!(target, "--> {name}: {}", artifact.describe()).ok();
        }
    }
}

/// Waits for Enter on stdin at every step boundary.
struct PromptPause;

impl DebugPause for PromptPause {
    fn pause<'a>(
        &'a self,
        location: PauseLocation,
        step: &'a str,
        _state: &'a StateBag,
    ) -> StepFuture<'a, ()> {
        Box::pin(async move {
            let mut stderr = io::stderr();
            write!(
                stderr,
                "Pausing {location} step '{step}'. Press enter to continue. "
            )
            .ok();
            stderr.flush().ok();
            tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                io::stdin().read_line(&mut line).map(drop)
            })
            .await
            .ok();
        })
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
