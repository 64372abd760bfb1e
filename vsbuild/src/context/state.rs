//! The typed state bag shared by the steps of one run.

use crate::driver::{Driver, VirtualMachine};
use crate::errors::{BuildError, BuildResult};
use crate::resolver::{ComputePlacement, ResolvedPlacement};
use crate::upload::UploadedObject;
use crate::utils::DatastorePath;
use std::collections::BTreeMap;
use std::path::PathBuf;

macro_rules! slot {
    ($(#[$meta:meta])* $field:ident, $set:ident, $require:ident, $ty:ty) => {
        $(#[$meta])*
        #[must_use]
        pub fn $field(&self) -> Option<&$ty> {
            self.$field.as_ref()
        }

        /// Publishes this entry.
        pub fn $set(&mut self, value: $ty) {
            self.$field = Some(value);
        }

        /// Returns this entry or fails with [`BuildError::MissingState`].
        pub fn $require(&self) -> BuildResult<&$ty> {
            self.$field.as_ref().ok_or(BuildError::MissingState {
                key: stringify!($field),
            })
        }
    };
}

/// State published by steps for later steps and for cleanup.
///
/// Created empty for each run and dropped at the end. Required entries are
/// read through `require_*`, which fails fast when an earlier step did not
/// publish them. `cancelled` and `halted` are set at most once, and only the
/// first recorded error is kept.
#[derive(Debug, Default)]
pub struct StateBag {
    driver: Option<Driver>,
    vm: Option<VirtualMachine>,
    compute: Option<ComputePlacement>,
    placement: Option<ResolvedPlacement>,
    iso_paths: Vec<PathBuf>,
    iso_remote_paths: Vec<DatastorePath>,
    cd_path: Option<DatastorePath>,
    floppy_path: Option<PathBuf>,
    uploaded_floppy_path: Option<DatastorePath>,
    uploaded: Vec<UploadedObject>,
    ip: Option<String>,
    snapshot: Option<String>,
    template: bool,
    vm_destroyed: bool,
    content_library_item_uuid: Option<String>,
    content_library_datastore: Option<String>,
    generated_files: Vec<PathBuf>,
    labels: BTreeMap<String, String>,
    error: Option<BuildError>,
    cancelled: bool,
    halted: bool,
}

impl StateBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    slot!(
        /// The connected driver.
        driver, set_driver, require_driver, Driver
    );
    slot!(
        /// The VM being built.
        vm, set_vm, require_vm, VirtualMachine
    );
    slot!(
        /// Folder, resource pool, cluster and host.
        compute, set_compute, require_compute, ComputePlacement
    );
    slot!(
        /// The resolved datastore and its selection method.
        placement, set_placement, require_placement, ResolvedPlacement
    );
    slot!(
        /// Datastore path of the CD image created for this build.
        cd_path, set_cd_path, require_cd_path, DatastorePath
    );
    slot!(
        /// Local floppy image.
        floppy_path, set_floppy_path, require_floppy_path, PathBuf
    );
    slot!(
        /// Datastore path of the uploaded floppy image.
        uploaded_floppy_path, set_uploaded_floppy_path, require_uploaded_floppy_path, DatastorePath
    );
    slot!(
        /// Guest IP address.
        ip, set_ip, require_ip, String
    );
    slot!(
        /// Name of the snapshot taken.
        snapshot, set_snapshot, require_snapshot, String
    );
    slot!(
        /// Id of the content library item created.
        content_library_item_uuid,
        set_content_library_item_uuid,
        require_content_library_item_uuid,
        String
    );
    slot!(
        /// Datastore backing the content library item.
        content_library_datastore,
        set_content_library_datastore,
        require_content_library_datastore,
        String
    );

    /// Local ISO files, in attach order.
    #[must_use]
    pub fn iso_paths(&self) -> &[PathBuf] {
        &self.iso_paths
    }

    /// Adds a local ISO file.
    pub fn push_iso_path(&mut self, path: PathBuf) {
        self.iso_paths.push(path);
    }

    /// Datastore paths of ISOs to attach.
    #[must_use]
    pub fn iso_remote_paths(&self) -> &[DatastorePath] {
        &self.iso_remote_paths
    }

    /// Adds a datastore ISO path.
    pub fn push_iso_remote_path(&mut self, path: DatastorePath) {
        self.iso_remote_paths.push(path);
    }

    /// Files placed on datastores by the upload steps.
    #[must_use]
    pub fn uploaded(&self) -> &[UploadedObject] {
        &self.uploaded
    }

    /// Records a file placed on a datastore.
    pub fn push_uploaded(&mut self, object: UploadedObject) {
        self.uploaded.push(object);
    }

    /// True if the VM was converted to a template.
    #[must_use]
    pub fn template(&self) -> bool {
        self.template
    }

    /// Records that the VM is now a template.
    pub fn set_template(&mut self) {
        self.template = true;
    }

    /// True if the VM was deleted by a step after a successful capture.
    #[must_use]
    pub fn vm_destroyed(&self) -> bool {
        self.vm_destroyed
    }

    /// Records that the VM no longer exists.
    pub fn set_vm_destroyed(&mut self) {
        self.vm_destroyed = true;
    }

    /// Local files produced by the build.
    #[must_use]
    pub fn generated_files(&self) -> &[PathBuf] {
        &self.generated_files
    }

    /// Adds a produced file.
    pub fn push_generated_file(&mut self, path: PathBuf) {
        self.generated_files.push(path);
    }

    /// Labels describing the built VM.
    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Mutable access to the labels.
    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.labels
    }

    /// The first error of the run.
    #[must_use]
    pub fn error(&self) -> Option<&BuildError> {
        self.error.as_ref()
    }

    /// Records `error` unless one is already recorded.
    ///
    /// Returns true if this error was stored.
    pub fn record_error(&mut self, error: BuildError) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// Takes the recorded error out of the bag.
    pub fn take_error(&mut self) -> Option<BuildError> {
        self.error.take()
    }

    /// True if the run was cancelled.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// True if a step halted the run.
    #[must_use]
    pub fn halted(&self) -> bool {
        self.halted
    }

    /// True if cleanup should tear resources down.
    #[must_use]
    pub fn should_teardown(&self) -> bool {
        self.cancelled || self.halted
    }

    /// Puts the published driver into teardown mode before cleanup.
    pub fn begin_teardown(&self) {
        let driver = self
            .driver
            .as_ref()
            .or_else(|| self.vm.as_ref().map(VirtualMachine::driver));
        if let Some(driver) = driver {
            driver.begin_teardown();
        }
    }

    /// Sets the `cancelled` flag. Later calls are ignored.
    pub fn mark_cancelled(&mut self) -> bool {
        if self.cancelled || self.halted {
            return false;
        }
        self.cancelled = true;
        true
    }

    /// Sets the `halted` flag. Later calls are ignored.
    pub fn mark_halted(&mut self) -> bool {
        if self.cancelled || self.halted {
            return false;
        }
        self.halted = true;
        true
    }
}
