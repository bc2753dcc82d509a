//! JSON build templates.
//!
//! A template names the builders to run and the provisioners and
//! post-processors applied to each of them:
//!
//! ```json
//! {
//!   "builders": [{ "type": "null", "name": "local", "communicator": "local" }],
//!   "provisioners": [{ "type": "shell", "inline": ["uname -a"] }],
//!   "post-processors": [{ "type": "manifest", "output": "manifest.json" }]
//! }
//! ```
//!
//! Provisioners and post-processors may carry `only` and `except` lists of
//! build names to restrict where they apply.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;

use crate::artifact::{ManifestConfig, ManifestPostProcessor, PostProcessor};
use crate::build::{Build, Builder};
use crate::cloud::{CloudBuilder, CloudConfig};
use crate::config::ScalewayConfig;
use crate::null::{NullBuilder, NullConfig};
use crate::process::ProcessCommandRunner;
use crate::provision::{
    HookedProvisioner, ProvisionError, ProvisionHook, ShellConfig, ShellProvisioner,
};
use crate::scaleway::ScalewayDriver;
use crate::virtualbox::{VirtualBoxVmBuilder, VirtualBoxVmConfig};

pub mod duration;
mod render;

pub use render::{RenderError, TemplateVars, render};

/// Errors raised while loading a template or turning it into builds.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// The template file could not be read.
    #[error("failed to read template {path}: {message}")]
    Read {
        /// Template path.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// The template is not valid JSON or does not match the schema.
    #[error("failed to parse template: {0}")]
    Parse(String),
    /// The template defines no builders.
    #[error("template defines no builders")]
    NoBuilders,
    /// Two builders share a name.
    #[error("build name {0:?} is used more than once")]
    DuplicateName(String),
    /// An `only`/`except` list names a build that does not exist.
    #[error("{context} refers to unknown build {name:?}")]
    UnknownBuild {
        /// Where the reference appears.
        context: String,
        /// Referenced build name.
        name: String,
    },
    /// A provisioner's configuration is invalid.
    #[error("provisioner {index}: {source}")]
    Provisioner {
        /// Zero-based position in the template.
        index: usize,
        /// Validation failure.
        #[source]
        source: ProvisionError,
    },
    /// A builder could not be constructed.
    #[error("builder {name}: {message}")]
    Builder {
        /// Build name.
        name: String,
        /// What went wrong.
        message: String,
    },
}

/// Builder settings, selected by the `type` field.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum BuilderKind {
    /// Provisions an existing host without creating a machine.
    #[serde(rename = "null")]
    Null(NullConfig),
    /// Builds a Scaleway image from a transient instance.
    #[serde(rename = "scaleway")]
    Scaleway(CloudConfig),
    /// Provisions and snapshots an existing VirtualBox VM.
    #[serde(rename = "virtualbox-vm")]
    VirtualBoxVm(VirtualBoxVmConfig),
}

impl BuilderKind {
    /// Template `type` of the builder.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null(_) => crate::null::BUILDER_TYPE,
            Self::Scaleway(_) => crate::scaleway::BUILDER_TYPE,
            Self::VirtualBoxVm(_) => crate::virtualbox::BUILDER_TYPE,
        }
    }
}

/// One entry of the `builders` array.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BuilderEntry {
    /// Build name; defaults to the builder type.
    #[serde(default)]
    pub name: Option<String>,
    /// Builder settings.
    #[serde(flatten)]
    pub kind: BuilderKind,
}

impl BuilderEntry {
    /// Name the build is known by.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.kind.type_name())
    }

    fn instantiate(&self) -> Result<Box<dyn Builder>, TemplateError> {
        let builder_error = |message: String| TemplateError::Builder {
            name: self.name().to_owned(),
            message,
        };
        Ok(match &self.kind {
            BuilderKind::Null(config) => Box::new(NullBuilder::new(config.clone())),
            BuilderKind::Scaleway(config) => {
                let credentials = ScalewayConfig::load_without_cli_args()
                    .map_err(|err| builder_error(err.to_string()))?;
                let driver =
                    ScalewayDriver::new(credentials).map_err(|err| builder_error(err.to_string()))?;
                Box::new(CloudBuilder::new(
                    crate::scaleway::BUILDER_TYPE,
                    config.clone(),
                    Arc::new(driver),
                ))
            }
            BuilderKind::VirtualBoxVm(config) => Box::new(VirtualBoxVmBuilder::new(
                config.clone(),
                Arc::new(ProcessCommandRunner),
            )),
        })
    }
}

/// Restricts an entry to some builds.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct BuildFilter {
    /// Apply only to these builds.
    #[serde(default)]
    pub only: Vec<String>,
    /// Never apply to these builds.
    #[serde(default)]
    pub except: Vec<String>,
}

impl BuildFilter {
    /// Returns `true` when the entry applies to `build`.
    #[must_use]
    pub fn applies_to(&self, build: &str) -> bool {
        if !self.only.is_empty() && !self.only.iter().any(|name| name == build) {
            return false;
        }
        !self.except.iter().any(|name| name == build)
    }

    fn check(&self, context: &str, known: &BTreeSet<&str>) -> Result<(), TemplateError> {
        for name in self.only.iter().chain(&self.except) {
            if !known.contains(name.as_str()) {
                return Err(TemplateError::UnknownBuild {
                    context: context.to_owned(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Provisioner settings, selected by the `type` field.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type")]
pub enum ProvisionerKind {
    /// Runs shell scripts.
    #[serde(rename = "shell")]
    Shell(ShellConfig),
}

/// One entry of the `provisioners` array.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ProvisionerEntry {
    /// Delay before the provisioner starts.
    #[serde(default, deserialize_with = "duration::option::deserialize")]
    pub pause_before: Option<Duration>,
    /// Extra attempts after a failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Builds the provisioner applies to.
    #[serde(flatten)]
    pub filter: BuildFilter,
    /// Provisioner settings.
    #[serde(flatten)]
    pub kind: ProvisionerKind,
}

impl ProvisionerEntry {
    fn hooked(&self) -> Result<HookedProvisioner, ProvisionError> {
        let provisioner = match &self.kind {
            ProvisionerKind::Shell(config) => ShellProvisioner::new(config.clone())?,
        };
        Ok(HookedProvisioner::new(Box::new(provisioner))
            .with_pause_before(self.pause_before)
            .with_max_retries(self.max_retries))
    }
}

/// Post-processor settings, selected by the `type` field.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type")]
pub enum PostProcessorKind {
    /// Records artifacts in a JSON manifest.
    #[serde(rename = "manifest")]
    Manifest(ManifestConfig),
}

/// One entry of the `post-processors` array.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct PostProcessorEntry {
    /// Builds the post-processor applies to.
    #[serde(flatten)]
    pub filter: BuildFilter,
    /// Post-processor settings.
    #[serde(flatten)]
    pub kind: PostProcessorKind,
}

/// A parsed build template.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Template {
    /// Machines to build.
    pub builders: Vec<BuilderEntry>,
    /// Provisioners run on every selected build, in order.
    #[serde(default)]
    pub provisioners: Vec<ProvisionerEntry>,
    /// Post-processors applied to each build's artifact, in order.
    #[serde(default, rename = "post-processors")]
    pub post_processors: Vec<PostProcessorEntry>,
}

impl Template {
    /// Parses and validates a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Parse`] for malformed JSON and the
    /// validation errors of [`Template::validate`].
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let template: Self =
            serde_json::from_str(text).map_err(|err| TemplateError::Parse(err.to_string()))?;
        template.validate()?;
        Ok(template)
    }

    /// Reads and parses the template at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Read`] when the file cannot be read, or any
    /// error of [`Template::parse`].
    pub fn load(path: &Utf8Path) -> Result<Self, TemplateError> {
        let text = std::fs::read_to_string(path).map_err(|err| TemplateError::Read {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        Self::parse(&text)
    }

    /// Checks build names and every `only`/`except` reference.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.builders.is_empty() {
            return Err(TemplateError::NoBuilders);
        }
        let mut known = BTreeSet::new();
        for entry in &self.builders {
            if !known.insert(entry.name()) {
                return Err(TemplateError::DuplicateName(entry.name().to_owned()));
            }
        }
        for (index, entry) in self.provisioners.iter().enumerate() {
            entry
                .filter
                .check(&format!("provisioner {index}"), &known)?;
        }
        for (index, entry) in self.post_processors.iter().enumerate() {
            entry
                .filter
                .check(&format!("post-processor {index}"), &known)?;
        }
        Ok(())
    }

    /// Build names in template order.
    #[must_use]
    pub fn build_names(&self) -> Vec<&str> {
        self.builders.iter().map(BuilderEntry::name).collect()
    }

    /// Builders selected by the command-line `--only` and `--except` lists.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::UnknownBuild`] when a list names a build the
    /// template does not define.
    pub fn select(
        &self,
        only: &[String],
        except: &[String],
    ) -> Result<Vec<&BuilderEntry>, TemplateError> {
        let filter = BuildFilter {
            only: only.to_vec(),
            except: except.to_vec(),
        };
        let known: BTreeSet<&str> = self.build_names().into_iter().collect();
        filter.check("command line", &known)?;
        Ok(self
            .builders
            .iter()
            .filter(|entry| filter.applies_to(entry.name()))
            .collect())
    }

    /// Assembles the provisioner hook for the build named `build`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Provisioner`] when a provisioner's settings
    /// are invalid.
    pub fn hook_for(&self, build: &str) -> Result<ProvisionHook, TemplateError> {
        let mut provisioners = Vec::new();
        for (index, entry) in self.provisioners.iter().enumerate() {
            if !entry.filter.applies_to(build) {
                continue;
            }
            let hooked = entry
                .hooked()
                .map_err(|source| TemplateError::Provisioner { index, source })?;
            provisioners.push(hooked);
        }
        Ok(ProvisionHook::new(provisioners))
    }

    /// Post-processors that apply to the build named `build`.
    #[must_use]
    pub fn post_processors_for(&self, build: &str) -> Vec<Box<dyn PostProcessor>> {
        self.post_processors
            .iter()
            .filter(|entry| entry.filter.applies_to(build))
            .map(|entry| match &entry.kind {
                PostProcessorKind::Manifest(config) => {
                    Box::new(ManifestPostProcessor::new(config.clone())) as Box<dyn PostProcessor>
                }
            })
            .collect()
    }

    /// Creates a [`Build`] for every selected builder.
    ///
    /// # Errors
    ///
    /// Returns selection, provisioner or builder construction errors.
    pub fn builds(&self, only: &[String], except: &[String]) -> Result<Vec<Build>, TemplateError> {
        self.select(only, except)?
            .into_iter()
            .map(|entry| {
                let name = entry.name();
                Ok(Build::new(name, entry.instantiate()?, self.hook_for(name)?)
                    .with_post_processors(self.post_processors_for(name)))
            })
            .collect()
    }
}
