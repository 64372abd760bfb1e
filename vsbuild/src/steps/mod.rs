//! Build steps.
//!
//! A step is one stage of a build. [`Step::run`] does the work and
//! publishes what later steps (and its own cleanup) need into the
//! [`StateBag`]; [`Step::cleanup`] runs after the pipeline stops, in reverse
//! order, and tears resources down when the bag says the run was halted or
//! cancelled.

mod boot;
mod connect;
mod content_library;
mod finalize;
mod guest;
mod hardware;
mod media;
mod placement;
mod power;
mod upload;
mod vm;

pub use boot::{StepBootCommand, StepBootOrder};
pub use connect::StepConnect;
pub use content_library::StepImportToContentLibrary;
pub use finalize::{StepCollectMetadata, StepConvertToTemplate, StepCreateSnapshot};
pub use guest::{StepProvision, StepShutdown, StepWaitForIp};
pub use hardware::StepConfigureHardware;
pub use media::{StepAddCdrom, StepAddFloppy, StepRemoveMedia};
pub use placement::StepResolvePlacement;
pub use power::StepPowerOn;
pub use upload::{StepDownload, StepRemoteUpload};
pub use vm::{StepCloneVm, StepCreateVm};

use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::errors::{BuildError, BuildResult};
use async_trait::async_trait;
use std::fmt::Debug;
use tracing::error;

/// One stage of a build pipeline.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Returns the name of the step. Unique within a pipeline.
    fn name(&self) -> &str;

    /// Does the work of the step.
    ///
    /// Returns [`StepAction::Halt`] to stop the run. A step that halts
    /// because of an error records it with [`halt`] first.
    async fn run(&self, ctx: &RunContext, state: &mut StateBag) -> StepAction;

    /// Undoes or finalizes the work of the step.
    ///
    /// Called once for every step whose `run` was called, whatever it
    /// returned. Errors are reported by the runner and never replace the
    /// run's recorded error.
    async fn cleanup(&self, _ctx: &RunContext, _state: &mut StateBag) -> BuildResult<()> {
        Ok(())
    }
}

/// Records `err` as the run's failure and returns [`StepAction::Halt`].
///
/// A cancellation is not a failure and is not recorded.
pub fn halt(state: &mut StateBag, step: &str, err: BuildError) -> StepAction {
    if err.is_cancellation() {
        return StepAction::Halt;
    }
    error!(step, error = %err, "step failed");
    state.record_error(err.in_step(step));
    StepAction::Halt
}

/// Runs `$body` (an expression of type `BuildResult<T>`) and halts the step
/// on error.
macro_rules! try_step {
    ($state:expr, $step:expr, $body:expr) => {
        match $body {
            Ok(value) => value,
            Err(err) => return $crate::steps::halt($state, $step, err),
        }
    };
}
pub(crate) use try_step;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RemoteError;

    #[test]
    fn test_halt_records_first_error_with_step_name() {
        let mut state = StateBag::new();
        let action = halt(
            &mut state,
            "create_vm",
            RemoteError::task_failed("no space").into(),
        );
        assert_eq!(action, StepAction::Halt);
        assert_eq!(
            state.error().unwrap().to_string(),
            "step 'create_vm' failed: remote task failed: no space"
        );
    }

    #[test]
    fn test_halt_does_not_record_cancellation() {
        let mut state = StateBag::new();
        halt(
            &mut state,
            "power_on",
            BuildError::Cancelled {
                operation: "power_on".into(),
            },
        );
        assert!(state.error().is_none());
    }
}
