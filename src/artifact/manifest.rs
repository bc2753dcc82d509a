//! Records build results in a JSON manifest file.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::{Artifact, ArtifactError, ArtifactFuture, PostProcessed, PostProcessor};
use crate::ui::Ui;

const KIND: &str = "manifest";

fn default_output() -> Utf8PathBuf {
    Utf8PathBuf::from("kiln-manifest.json")
}

/// Template settings for the `manifest` post-processor.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ManifestConfig {
    /// Manifest file to create or extend.
    #[serde(default = "default_output")]
    pub output: Utf8PathBuf,
    /// Records file names without their directories.
    #[serde(default)]
    pub strip_path: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            strip_path: false,
        }
    }
}

/// One build recorded in the manifest.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ManifestEntry {
    /// Build name.
    pub name: String,
    /// Builder type that produced the artifact.
    pub builder_type: String,
    /// Seconds since the Unix epoch when the entry was written.
    pub build_time: u64,
    /// Files owned by the artifact.
    pub files: Vec<String>,
    /// Artifact identifier.
    pub artifact_id: String,
    /// Identifies the `kiln build` invocation that wrote the entry.
    pub run_uuid: String,
}

/// Manifest file layout.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Manifest {
    /// Every build recorded so far, oldest first.
    #[serde(default)]
    pub builds: Vec<ManifestEntry>,
    /// Run that wrote the newest entry.
    #[serde(default)]
    pub last_run_uuid: String,
}

/// Appends an entry per artifact to a JSON manifest and keeps the artifact.
#[derive(Clone, Debug)]
pub struct ManifestPostProcessor {
    config: ManifestConfig,
    run_uuid: String,
}

impl ManifestPostProcessor {
    /// Creates the post-processor with a fresh run identifier.
    #[must_use]
    pub fn new(config: ManifestConfig) -> Self {
        Self {
            config,
            run_uuid: Uuid::new_v4().to_string(),
        }
    }

    /// Path of the manifest file.
    #[must_use]
    pub fn output(&self) -> &Utf8Path {
        &self.config.output
    }

    fn entry(&self, build: &str, artifact: &dyn Artifact) -> ManifestEntry {
        let files = artifact
            .files()
            .iter()
            .map(|file| {
                if self.config.strip_path {
                    file.file_name().unwrap_or_else(|| file.as_str()).to_owned()
                } else {
                    file.to_string()
                }
            })
            .collect();
        let build_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        ManifestEntry {
            name: build.to_owned(),
            builder_type: artifact.builder_id().to_owned(),
            build_time,
            files,
            artifact_id: artifact.id(),
            run_uuid: self.run_uuid.clone(),
        }
    }

    fn record(&self, entry: ManifestEntry) -> Result<(), ArtifactError> {
        let path = &self.config.output;
        let dir = open_parent(path).map_err(|message| failure(path, &message))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| failure(path, "manifest path is missing a filename"))?;

        let mut manifest = match dir.read_to_string(file_name) {
            Ok(contents) if contents.trim().is_empty() => Manifest::default(),
            Ok(contents) => serde_json::from_str::<Manifest>(&contents)
                .map_err(|err| failure(path, &err.to_string()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Manifest::default(),
            Err(err) => return Err(failure(path, &err.to_string())),
        };
        manifest.last_run_uuid = entry.run_uuid.clone();
        manifest.builds.push(entry);

        let rendered = serde_json::to_string_pretty(&manifest)
            .map_err(|err| failure(path, &err.to_string()))?;
        dir.write(file_name, rendered)
            .map_err(|err| failure(path, &err.to_string()))
    }
}

fn open_parent(path: &Utf8Path) -> Result<Dir, String> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .and_then(|()| Dir::open_ambient_dir(parent, ambient_authority()))
        .map_err(|err| format!("{parent}: {err}"))
}

fn failure(path: &Utf8Path, message: &str) -> ArtifactError {
    ArtifactError::PostProcess {
        kind: String::from(KIND),
        message: format!("{path}: {message}"),
    }
}

impl PostProcessor for ManifestPostProcessor {
    fn kind(&self) -> &str {
        KIND
    }

    fn post_process<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        ui: &'a dyn Ui,
        build: &'a str,
        artifact: &'a dyn Artifact,
    ) -> ArtifactFuture<'a, PostProcessed> {
        Box::pin(async move {
            self.record(self.entry(build, artifact))?;
            info!(build, output = %self.config.output, "manifest updated");
            ui.say(&format!("Recorded {} in {}", artifact.id(), self.config.output));
            Ok(PostProcessed {
                artifact: None,
                keep_input: true,
            })
        })
    }
}
