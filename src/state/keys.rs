//! Well-known state bag keys shared across builders and common steps.

use camino::Utf8PathBuf;

use super::StateKey;
use crate::communicator::SharedCommunicator;
use crate::provision::ProvisionHook;
use crate::step::StepError;
use crate::ui::SharedUi;

/// User interface the build reports progress through.
pub const UI: StateKey<SharedUi> = StateKey::new("ui");
/// Provisioner dispatcher invoked by the provision step.
pub const HOOK: StateKey<ProvisionHook> = StateKey::new("hook");
/// Live communicator published once the machine is reachable.
pub const COMMUNICATOR: StateKey<SharedCommunicator> = StateKey::new("communicator");
/// Last error recorded by a failing step.
pub const ERROR: StateKey<StepError> = StateKey::new("error");

/// Name of the build as written in the template.
pub const BUILD_NAME: StateKey<String> = StateKey::new("build_name");
/// Builder type, for example `scaleway`.
pub const BUILDER_TYPE: StateKey<String> = StateKey::new("builder_type");

/// Port of the HTTP server serving installer files, when one runs.
pub const HTTP_PORT: StateKey<u16> = StateKey::new("http_port");
/// Address the machine reaches the HTTP server on.
pub const HTTP_IP: StateKey<String> = StateKey::new("http_ip");
/// Local path of the installation ISO.
pub const ISO_PATH: StateKey<Utf8PathBuf> = StateKey::new("iso_path");
/// Local path of the generated floppy image.
pub const FLOPPY_PATH: StateKey<Utf8PathBuf> = StateKey::new("floppy_path");
/// Name of the virtual machine under construction.
pub const VM_NAME: StateKey<String> = StateKey::new("vm_name");
/// Provider identifier of the cloud instance under construction.
pub const INSTANCE_ID: StateKey<String> = StateKey::new("instance_id");
/// Host the communicator connects to.
pub const SSH_HOST: StateKey<String> = StateKey::new("ssh_host");
/// Port the communicator connects to on [`SSH_HOST`].
pub const SSH_HOST_PORT: StateKey<u16> = StateKey::new("ssh_host_port");

/// Provider client of a builder. Each builder picks the concrete type.
#[must_use]
pub const fn driver<D>() -> StateKey<D> {
    StateKey::new("driver")
}
