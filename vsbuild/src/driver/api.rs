//! The management-plane RPC surface consumed by the driver.
//!
//! Transport is not part of this crate: a deployment supplies an
//! implementation of [`ManagementApi`] (SOAP, REST, or the in-memory
//! simulator in `crate::testing`). Everything above this trait is typed.

use super::spec::{CloneSpec, ConfigSpec, CreateSpec, ImportSpec, UsbScanCode};
use crate::errors::RemoteError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Property values keyed by property path (e.g. `config.hardware.numCPU`).
pub type PropertyMap = HashMap<String, serde_json::Value>;

/// Kinds of inventory objects the builder touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A datacenter.
    Datacenter,
    /// A VM folder.
    Folder,
    /// A compute cluster.
    Cluster,
    /// An ESXi host.
    Host,
    /// A resource pool.
    ResourcePool,
    /// A single datastore.
    Datastore,
    /// A datastore cluster (Storage DRS pod).
    StoragePod,
    /// A network or distributed port group.
    Network,
    /// A virtual machine or template.
    VirtualMachine,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Datacenter => "datacenter",
            Self::Folder => "folder",
            Self::Cluster => "cluster",
            Self::Host => "host",
            Self::ResourcePool => "resource pool",
            Self::Datastore => "datastore",
            Self::StoragePod => "datastore cluster",
            Self::Network => "network",
            Self::VirtualMachine => "virtual machine",
        };
        f.write_str(s)
    }
}

/// Opaque identity of a remote managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    /// Object kind.
    pub kind: ObjectKind,
    /// Server-assigned identifier (e.g. `vm-42`).
    pub id: String,
}

impl ManagedObjectRef {
    /// Creates a new reference.
    #[must_use]
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Login material for the management API.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Server host name or address.
    pub server: String,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Skip TLS verification.
    pub insecure: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Main API session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId(pub String);

/// Session for the content-catalog sub-protocol, separate from the main session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSession(pub String);

/// Handle of an asynchronous remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    /// Task identifier.
    pub id: String,
    /// What the task does.
    pub description: String,
}

/// Lifecycle state of a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, not started.
    Queued,
    /// In progress.
    Running,
    /// Finished successfully.
    Success,
    /// Finished in error.
    Error,
}

/// Snapshot of a remote task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Current state.
    pub state: TaskState,
    /// Result value for successful tasks (e.g. a created object reference).
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Remote error message for failed tasks.
    #[serde(default)]
    pub error: Option<String>,
    /// Percentage complete, when reported.
    #[serde(default)]
    pub progress: Option<u8>,
}

/// Storage placement request for a datastore cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRequest {
    /// The datastore cluster to choose from.
    pub storage_pod: ManagedObjectRef,
    /// Target resource pool, when known.
    pub resource_pool: Option<ManagedObjectRef>,
    /// Target host, when known.
    pub host: Option<ManagedObjectRef>,
    /// Name of the VM being placed.
    pub vm_name: String,
    /// Size of the disk being placed, in KiB.
    pub disk_size_kb: Option<i64>,
}

/// Content library summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryInfo {
    /// Library identifier.
    pub id: String,
    /// Library name.
    pub name: String,
    /// Names of datastores backing the library.
    #[serde(default)]
    pub datastores: Vec<String>,
}

/// Content library item summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryItemInfo {
    /// Item identifier (UUID).
    pub id: String,
    /// Item name.
    pub name: String,
    /// Owning library.
    pub library_id: String,
    /// Item type (`ovf` or `vm-template`).
    pub item_type: String,
}

/// Notification emitted while a library item is being published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PublishEvent {
    /// Progress update in percent.
    Progress {
        /// Percent complete.
        percent: u8,
    },
    /// Publishing finished.
    Completed,
    /// Publishing failed on the backend.
    Failed {
        /// Backend message.
        message: String,
    },
}

/// A mutating operation. Every variant is submitted as a remote task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create a new VM.
    CreateVm {
        /// Destination folder.
        folder: ManagedObjectRef,
        /// Destination resource pool.
        resource_pool: ManagedObjectRef,
        /// Optional pinned host.
        host: Option<ManagedObjectRef>,
        /// VM definition.
        spec: CreateSpec,
    },
    /// Clone a VM or template.
    CloneVm {
        /// The source VM.
        source: ManagedObjectRef,
        /// Clone definition.
        spec: CloneSpec,
    },
    /// Apply a configuration delta.
    Reconfigure {
        /// Target VM.
        vm: ManagedObjectRef,
        /// The delta.
        spec: ConfigSpec,
    },
    /// Power on.
    PowerOn {
        /// Target VM.
        vm: ManagedObjectRef,
    },
    /// Hard power off.
    PowerOff {
        /// Target VM.
        vm: ManagedObjectRef,
    },
    /// Ask guest tools to shut the OS down.
    ShutdownGuest {
        /// Target VM.
        vm: ManagedObjectRef,
    },
    /// Type keys into the console.
    PutUsbScanCodes {
        /// Target VM.
        vm: ManagedObjectRef,
        /// Key events.
        codes: Vec<UsbScanCode>,
    },
    /// Take a snapshot.
    CreateSnapshot {
        /// Target VM.
        vm: ManagedObjectRef,
        /// Snapshot name.
        name: String,
        /// Snapshot description.
        description: String,
    },
    /// Remove a snapshot by name.
    RemoveSnapshot {
        /// Target VM.
        vm: ManagedObjectRef,
        /// Snapshot name.
        name: String,
    },
    /// Mark a powered-off VM as template.
    MarkAsTemplate {
        /// Target VM.
        vm: ManagedObjectRef,
    },
    /// Turn a template back into a virtual machine.
    MarkAsVirtualMachine {
        /// Target template.
        vm: ManagedObjectRef,
        /// Resource pool the VM joins.
        resource_pool: ManagedObjectRef,
    },
    /// Unregister and delete a VM.
    Destroy {
        /// Target VM.
        vm: ManagedObjectRef,
    },
    /// Create a directory on a datastore.
    MakeDirectory {
        /// Datastore.
        datastore: ManagedObjectRef,
        /// Datastore-relative path.
        path: String,
    },
    /// Delete a file on a datastore.
    DeleteFile {
        /// Datastore.
        datastore: ManagedObjectRef,
        /// Datastore-relative path.
        path: String,
    },
    /// Capture a VM into a content library.
    ImportToLibrary {
        /// Catalog session.
        session: CatalogSession,
        /// Source VM.
        vm: ManagedObjectRef,
        /// Destination library.
        library_id: String,
        /// Item definition.
        spec: ImportSpec,
    },
    /// Publish a library item to subscribers.
    PublishLibraryItem {
        /// Catalog session.
        session: CatalogSession,
        /// Item to publish.
        item_id: String,
    },
    /// Delete a library item.
    DeleteLibraryItem {
        /// Catalog session.
        session: CatalogSession,
        /// Item to delete.
        item_id: String,
    },
}

impl Operation {
    /// Returns a short name for logs and error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateVm { .. } => "create_vm",
            Self::CloneVm { .. } => "clone_vm",
            Self::Reconfigure { .. } => "reconfigure",
            Self::PowerOn { .. } => "power_on",
            Self::PowerOff { .. } => "power_off",
            Self::ShutdownGuest { .. } => "shutdown_guest",
            Self::PutUsbScanCodes { .. } => "put_usb_scan_codes",
            Self::CreateSnapshot { .. } => "create_snapshot",
            Self::RemoveSnapshot { .. } => "remove_snapshot",
            Self::MarkAsTemplate { .. } => "mark_as_template",
            Self::MarkAsVirtualMachine { .. } => "mark_as_virtual_machine",
            Self::Destroy { .. } => "destroy",
            Self::MakeDirectory { .. } => "make_directory",
            Self::DeleteFile { .. } => "delete_file",
            Self::ImportToLibrary { .. } => "import_to_library",
            Self::PublishLibraryItem { .. } => "publish_library_item",
            Self::DeleteLibraryItem { .. } => "delete_library_item",
        }
    }
}

/// The opaque RPC service behind the driver.
///
/// Reads return property maps, mutations return task handles that must be
/// polled with [`ManagementApi::task_info`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync + fmt::Debug {
    /// Opens the main session.
    async fn login(&self, credentials: &Credentials) -> Result<SessionId, RemoteError>;

    /// Closes the main session.
    async fn logout(&self, session: &SessionId) -> Result<(), RemoteError>;

    /// Finds objects of `kind` by name or inventory path.
    ///
    /// Returns every match; the driver decides what ambiguity means.
    async fn find(
        &self,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Vec<ManagedObjectRef>, RemoteError>;

    /// Reads properties of an object. An empty `paths` slice fetches all.
    async fn retrieve_properties(
        &self,
        object: &ManagedObjectRef,
        paths: &[String],
    ) -> Result<PropertyMap, RemoteError>;

    /// Submits a mutating operation.
    async fn submit(&self, operation: Operation) -> Result<TaskRef, RemoteError>;

    /// Reads the current state of a task.
    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo, RemoteError>;

    /// Asks Storage DRS for datastore recommendations, best first.
    ///
    /// An empty result means the service has no opinion.
    async fn recommend_datastores(
        &self,
        request: &PlacementRequest,
    ) -> Result<Vec<ManagedObjectRef>, RemoteError>;

    /// Checks whether a datastore path exists.
    async fn file_exists(
        &self,
        datastore: &ManagedObjectRef,
        path: &str,
    ) -> Result<bool, RemoteError>;

    /// Streams a local file to a datastore path.
    async fn upload_file(
        &self,
        datastore: &ManagedObjectRef,
        local: &Path,
        remote_path: &str,
        host: Option<ManagedObjectRef>,
    ) -> Result<(), RemoteError>;

    /// Opens a content-catalog session.
    async fn catalog_login(&self, credentials: &Credentials) -> Result<CatalogSession, RemoteError>;

    /// Closes a content-catalog session.
    async fn catalog_logout(&self, session: &CatalogSession) -> Result<(), RemoteError>;

    /// Looks up a content library by name.
    async fn find_library(
        &self,
        session: &CatalogSession,
        name: &str,
    ) -> Result<Option<LibraryInfo>, RemoteError>;

    /// Looks up an item inside a library by name.
    async fn find_library_item(
        &self,
        session: &CatalogSession,
        library_id: &str,
        name: &str,
    ) -> Result<Option<LibraryItemInfo>, RemoteError>;

    /// Subscribes to publish notifications for an item.
    async fn watch_publish(
        &self,
        session: &CatalogSession,
        item_id: &str,
    ) -> Result<BoxStream<'static, PublishEvent>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_display() {
        let vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, "vm-42");
        assert_eq!(vm.to_string(), "virtual machine:vm-42");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            server: "vc.example.com".into(),
            username: "builder".into(),
            password: "hunter2".into(),
            insecure: false,
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_publish_event_wire_format() {
        let json = serde_json::to_value(PublishEvent::Progress { percent: 40 }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "progress", "percent": 40}));
    }

    #[test]
    fn test_operation_names_are_stable() {
        let op = Operation::PowerOn {
            vm: ManagedObjectRef::new(ObjectKind::VirtualMachine, "vm-1"),
        };
        assert_eq!(op.name(), "power_on");
    }
}
