//! Build results and the post-processors that consume them.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ui::Ui;

mod manifest;

pub use manifest::{ManifestConfig, ManifestPostProcessor};

/// Errors raised by artifacts and post-processors.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArtifactError {
    /// Deleting the artifact's resources failed.
    #[error("failed to destroy artifact {id}: {message}")]
    Destroy {
        /// Artifact identifier.
        id: String,
        /// Provider or filesystem error.
        message: String,
    },
    /// A post-processor failed.
    #[error("post-processor {kind} failed: {message}")]
    PostProcess {
        /// Post-processor type.
        kind: String,
        /// What went wrong.
        message: String,
    },
    /// The cancellation token fired.
    #[error("post-processing cancelled")]
    Cancelled,
}

/// Future returned by artifact and post-processor operations.
pub type ArtifactFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ArtifactError>> + Send + 'a>>;

/// Result of a build: an image, a snapshot, files on disk.
pub trait Artifact: Send + Sync + fmt::Debug {
    /// Identifier of the builder type that produced it.
    fn builder_id(&self) -> &str;

    /// Stable identifier, for example an image ID.
    fn id(&self) -> String;

    /// Local files the artifact owns.
    fn files(&self) -> &[Utf8PathBuf] {
        &[]
    }

    /// Provider-specific detail under `name`, such as `zone`.
    fn state(&self, _name: &str) -> Option<serde_json::Value> {
        None
    }

    /// Human readable summary printed when the build succeeds.
    fn describe(&self) -> String {
        format!("{}: {}", self.builder_id(), self.id())
    }

    /// Deletes whatever the artifact owns.
    fn destroy(&self) -> ArtifactFuture<'_, ()>;
}

/// What a post-processor made of its input.
#[derive(Debug, Default)]
pub struct PostProcessed {
    /// A derived artifact, if one was produced.
    pub artifact: Option<Box<dyn Artifact>>,
    /// Asks for the input artifact to be kept.
    pub keep_input: bool,
}

/// Transforms or records a build's artifact.
pub trait PostProcessor: Send + Sync {
    /// Template `type` of the post-processor.
    fn kind(&self) -> &str;

    /// Processes `artifact`, the output of the build named `build`.
    fn post_process<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        ui: &'a dyn Ui,
        build: &'a str,
        artifact: &'a dyn Artifact,
    ) -> ArtifactFuture<'a, PostProcessed>;
}

/// Runs `processors` over `artifact` and returns the artifacts to report.
///
/// Every processor sees the build's own artifact. Once all succeed the input
/// is destroyed unless `keep` is set, some processor asked to keep it, or no
/// processor ran at all, in which case it is the build's only result.
///
/// # Errors
///
/// Returns the first post-processor failure; the input artifact is kept in
/// that case. A failed destroy is reported to `ui` and does not fail the
/// publication.
pub async fn publish(
    cancel: &CancellationToken,
    ui: &dyn Ui,
    build: &str,
    artifact: Box<dyn Artifact>,
    processors: &[Box<dyn PostProcessor>],
    keep: bool,
) -> Result<Vec<Box<dyn Artifact>>, ArtifactError> {
    if processors.is_empty() {
        return Ok(vec![artifact]);
    }

    let mut derived = Vec::new();
    let mut keep_input = keep;
    for processor in processors {
        if cancel.is_cancelled() {
            return Err(ArtifactError::Cancelled);
        }
        ui.say(&format!("Running post-processor: {}", processor.kind()));
        let processed = processor
            .post_process(cancel, ui, build, artifact.as_ref())
            .await?;
        keep_input |= processed.keep_input;
        derived.extend(processed.artifact);
    }

    if keep_input {
        info!(build, artifact = %artifact.id(), "keeping input artifact");
        derived.insert(0, artifact);
    } else {
        ui.say(&format!("Deleting intermediate artifact {}", artifact.id()));
        if let Err(err) = artifact.destroy().await {
            warn!(build, error = %err, "failed to destroy input artifact");
            ui.error(&err.to_string());
        }
    }
    Ok(derived)
}
