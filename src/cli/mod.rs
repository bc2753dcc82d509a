//! Command-line interface definitions for the `kiln` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `kiln` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    about = "Build machine images from a JSON template",
    version,
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Diagnostic log filter written to stderr (for example `info` or
    /// `kiln=debug`).
    #[arg(long, global = true, value_name = "LEVEL", default_value = "warn")]
    pub(crate) log_level: String,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `kiln`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Check that a template parses and every builder accepts its settings.
    #[command(name = "validate")]
    Validate(ValidateCommand),
    /// Run the builds a template defines.
    #[command(name = "build")]
    Build(BuildCommand),
}

/// Arguments for the `kiln validate` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ValidateCommand {
    /// Path of the JSON template.
    #[arg(value_name = "TEMPLATE")]
    pub(crate) template: String,
}

/// Arguments for the `kiln build` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BuildCommand {
    /// Run only the named build. May be repeated.
    #[arg(long, value_name = "NAME", conflicts_with = "except")]
    pub(crate) only: Vec<String>,
    /// Skip the named build. May be repeated.
    #[arg(long, value_name = "NAME")]
    pub(crate) except: Vec<String>,
    /// Pause before and after every step until Enter is pressed.
    ///
    /// Builds run one at a time either way; the pause gives a chance to
    /// inspect the machine between steps.
    #[arg(long)]
    pub(crate) debug: bool,
    /// Path of the JSON template.
    #[arg(value_name = "TEMPLATE")]
    pub(crate) template: String,
}
