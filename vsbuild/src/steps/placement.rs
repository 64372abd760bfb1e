//! Compute and datastore placement.

use super::{try_step, Step};
use crate::config::LocationConfig;
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::resolver::{resolve_compute, resolve_datastore, DatastoreTarget, PlacementHints};
use async_trait::async_trait;
use tracing::info;

/// Resolves folder, compute and datastore, publishing `compute` and
/// `placement`.
///
/// Without a datastore target (clones that stay on the source datastore)
/// only `compute` is published.
#[derive(Debug)]
pub struct StepResolvePlacement {
    vm_name: String,
    location: LocationConfig,
    datastore: Option<DatastoreTarget>,
}

impl StepResolvePlacement {
    /// Creates the step.
    #[must_use]
    pub fn new(
        vm_name: impl Into<String>,
        location: LocationConfig,
        datastore: Option<DatastoreTarget>,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            location,
            datastore,
        }
    }
}

#[async_trait]
impl Step for StepResolvePlacement {
    fn name(&self) -> &str {
        "resolve_placement"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        let driver = try_step!(state, self.name(), state.require_driver()).clone();
        let location = &self.location;

        let compute = try_step!(
            state,
            self.name(),
            resolve_compute(
                &driver,
                &location.folder,
                location.cluster.as_deref(),
                location.host.as_deref(),
                location.resource_pool.as_deref(),
            )
            .await
        );

        if let Some(target) = &self.datastore {
            let hints = PlacementHints {
                resource_pool: Some(compute.resource_pool.reference().clone()),
                host: compute.host.as_ref().map(|h| h.reference().clone()),
                vm_name: self.vm_name.clone(),
            };
            let placement = try_step!(
                state,
                self.name(),
                resolve_datastore(&driver, target, &hints).await
            );
            info!(
                datastore = placement.datastore.name(),
                method = %placement.method,
                "placement resolved"
            );
            state.set_placement(placement);
        }

        state.set_compute(compute);
        StepAction::Continue
    }
}
