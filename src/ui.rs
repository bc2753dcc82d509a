//! User-facing progress output.
//!
//! Diagnostics go through `tracing`; what a person running a build should
//! read goes through a [`Ui`].

use std::io::{self, Write};
use std::sync::Arc;

use crate::state::{StateBag, keys};

/// Sink for build progress messages.
pub trait Ui: Send + Sync {
    /// Reports a major milestone.
    fn say(&self, message: &str);
    /// Reports detail, such as remote command output.
    fn message(&self, message: &str);
    /// Reports a failure.
    fn error(&self, message: &str);
}

/// Shared handle stored in the state bag.
pub type SharedUi = Arc<dyn Ui>;

/// Writes progress to the terminal, prefixing each line with the build name.
#[derive(Clone, Debug)]
pub struct ConsoleUi {
    name: String,
}

impl ConsoleUi {
    /// Creates a console UI for the named build.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn render(&self, marker: &str, message: &str) -> String {
        message
            .lines()
            .map(|line| format!("{marker} {}: {line}", self.name))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        writeln!(io::stdout(), "{}", self.render("==>", message)).ok();
    }

    fn message(&self, message: &str) {
        writeln!(io::stdout(), "{}", self.render("   ", message)).ok();
    }

    fn error(&self, message: &str) {
        writeln!(io::stderr(), "{}", self.render("==>", message)).ok();
    }
}

/// Drops every message; used when a bag carries no UI.
#[derive(Clone, Copy, Debug, Default)]
struct Discard;

impl Ui for Discard {
    fn say(&self, _message: &str) {}
    fn message(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Returns the UI stored in `state`, or one that discards everything.
#[must_use]
pub fn from_state(state: &StateBag) -> SharedUi {
    state
        .get(keys::UI)
        .map_or_else(|| Arc::new(Discard) as SharedUi, |ui| SharedUi::clone(&ui))
}
