//! Steps shared by every builder.
//!
//! Builders compose these with their own provider-specific steps. Each one
//! reads its inputs from the state bag and publishes its outputs there:
//!
//! * [`StepConnect`] waits for the machine and publishes `communicator`.
//! * [`StepTypeBootCommand`] types the boot command into the console.
//! * [`StepProvision`] runs the `hook` over the communicator.
//! * [`StepShutdown`] halts the machine and waits for it to stop.

mod boot;
mod connect;
mod provision;
mod shutdown;

pub use boot::{BackendFactory, StepTypeBootCommand};
pub use connect::{CommConfig, CommunicatorKind, ConnectorFactory, StepConnect, load_ssh_settings};
pub use provision::StepProvision;
pub use shutdown::{MachineControl, MachineError, MachineFuture, StepShutdown};
