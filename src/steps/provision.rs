//! Runs the provisioner hook over the live communicator.

use tokio_util::sync::CancellationToken;

use crate::communicator::Communicator;
use crate::provision::{ProvisionData, ProvisionError};
use crate::state::{StateBag, keys};
use crate::step::{Action, Step, StepError, StepFuture, halt};
use crate::ui;

const NAME: &str = "provision";

/// Dispatches the `hook` stored in the bag.
///
/// A bag without a hook has nothing to provision and continues.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepProvision;

impl Step for StepProvision {
    fn name(&self) -> &str {
        NAME
    }

    fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a StateBag,
    ) -> StepFuture<'a, Action> {
        Box::pin(async move {
            let Some(hook) = state.get(keys::HOOK) else {
                return Action::Continue;
            };
            let ui = ui::from_state(state);
            let shared = state.get(keys::COMMUNICATOR);
            let comm: Option<&dyn Communicator> = shared.as_deref().map(|arc| &**arc);
            let data = ProvisionData::from_state(state);

            match hook.run(cancel, ui.as_ref(), comm, &data).await {
                Ok(()) => Action::Continue,
                Err(ProvisionError::Cancelled) => Action::Cancel,
                Err(err) => halt(state, StepError::new(NAME, err)),
            }
        })
    }
}
