//! Template fixtures shared by the CLI tests.
//!
//! Include with:
//!
//! ```rust
//! #[path = "common/templates.rs"]
//! mod templates;
//! ```

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tempfile::TempDir;

/// Scratch directory holding a template and whatever its builds touch.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates an empty workspace.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        Self { dir }
    }

    /// Root of the workspace.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Writes `template` as `template.json` and returns its path as a string.
    pub fn write_template(&self, template: &Value) -> String {
        let path = self.file("template.json");
        let body = serde_json::to_string_pretty(template)
            .unwrap_or_else(|err| panic!("serialise template: {err}"));
        std::fs::write(&path, body).unwrap_or_else(|err| panic!("write template: {err}"));
        path.display().to_string()
    }

    /// Writes raw text as `template.json`.
    pub fn write_raw(&self, text: &str) -> String {
        let path = self.file("template.json");
        std::fs::write(&path, text).unwrap_or_else(|err| panic!("write template: {err}"));
        path.display().to_string()
    }

    /// A local shell provisioner running `commands` with scripts under the workspace.
    pub fn shell(&self, commands: &[String]) -> Value {
        json!({
            "type": "shell",
            "inline": commands,
            "remote_folder": self.path().display().to_string(),
        })
    }
}

/// A null builder that provisions this host.
pub fn local_builder(name: &str) -> Value {
    json!({ "type": "null", "name": name, "communicator": "local" })
}
