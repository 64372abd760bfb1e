//! CD-ROM and floppy devices.

use super::{try_step, Step};
use crate::context::{RunContext, StateBag};
use crate::core::StepAction;
use crate::errors::BuildResult;
use async_trait::async_trait;
use tracing::debug;

/// Attaches one CD-ROM per datastore ISO and one for the generated CD image.
#[derive(Debug)]
pub struct StepAddCdrom {
    cdrom_type: String,
}

impl StepAddCdrom {
    /// Creates the step. `cdrom_type` is the controller type (`ide` or `sata`).
    #[must_use]
    pub fn new(cdrom_type: impl Into<String>) -> Self {
        Self {
            cdrom_type: cdrom_type.into(),
        }
    }

    async fn attach(&self, state: &StateBag) -> BuildResult<()> {
        let vm = state.require_vm()?;
        let images = state
            .iso_remote_paths()
            .iter()
            .chain(state.cd_path())
            .map(ToString::to_string);
        for image in images {
            debug!(image = %image, "attaching CD-ROM");
            vm.add_cdrom(&self.cdrom_type, Some(image.as_str())).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for StepAddCdrom {
    fn name(&self) -> &str {
        "add_cdrom"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        try_step!(state, self.name(), self.attach(state).await);
        StepAction::Continue
    }
}

/// Attaches a floppy drive with the uploaded or configured image.
///
/// Does nothing when no image is available.
#[derive(Debug, Default)]
pub struct StepAddFloppy {
    image_path: Option<String>,
}

impl StepAddFloppy {
    /// Creates the step. `image_path` is a datastore path used when no
    /// image was uploaded.
    #[must_use]
    pub fn new(image_path: Option<String>) -> Self {
        Self { image_path }
    }

    async fn attach(&self, state: &StateBag) -> BuildResult<()> {
        let image = state
            .uploaded_floppy_path()
            .map(ToString::to_string)
            .or_else(|| self.image_path.clone());
        let Some(image) = image else {
            return Ok(());
        };
        state.require_vm()?.add_floppy(Some(image.as_str())).await
    }
}

#[async_trait]
impl Step for StepAddFloppy {
    fn name(&self) -> &str {
        "add_floppy"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        try_step!(state, self.name(), self.attach(state).await);
        StepAction::Continue
    }
}

/// Ejects every CD-ROM after the guest is shut down, optionally removes the
/// drives, and removes the floppy drive.
///
/// Running it against a VM that has no media is a no-op.
#[derive(Debug, Default)]
pub struct StepRemoveMedia {
    remove_cdrom: bool,
    remove_floppy: bool,
}

impl StepRemoveMedia {
    /// Creates the step.
    #[must_use]
    pub fn new(remove_cdrom: bool, remove_floppy: bool) -> Self {
        Self {
            remove_cdrom,
            remove_floppy,
        }
    }

    async fn remove(&self, state: &StateBag) -> BuildResult<()> {
        let vm = state.require_vm()?;
        vm.eject_cdroms().await?;
        if self.remove_cdrom {
            vm.remove_cdroms().await?;
        }
        if self.remove_floppy {
            vm.remove_floppy().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for StepRemoveMedia {
    fn name(&self) -> &str {
        "remove_media"
    }

    async fn run(&self, _ctx: &RunContext, state: &mut StateBag) -> StepAction {
        try_step!(state, self.name(), self.remove(state).await);
        StepAction::Continue
    }
}
