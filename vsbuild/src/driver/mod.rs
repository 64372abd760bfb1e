//! Typed façade over the management API.
//!
//! [`ManagementApi`] is the opaque RPC service. [`Driver`] wraps it with a
//! session, the run's cancellation token, and the submit-then-await task
//! protocol; [`VirtualMachine`] and the inventory handles hang off it.

pub mod api;
mod client;
pub mod devices;
mod inventory;
mod library;
pub mod spec;
mod vm;

pub use api::{
    CatalogSession, Credentials, LibraryInfo, LibraryItemInfo, ManagedObjectRef, ManagementApi,
    ObjectKind, Operation, PlacementRequest, PropertyMap, PublishEvent, SessionId, TaskInfo,
    TaskRef, TaskState,
};
pub use client::{Driver, DriverSettings};
pub use devices::{DeviceList, VirtualDevice};
pub use inventory::{Cluster, Datastore, Folder, Host, Network, ResourcePool, StoragePod};
pub use library::CatalogClient;
pub use spec::{
    BootDevice, CloneSpec, ConfigSpec, CreateSpec, DeviceChange, DiskSpec, Firmware, ImportSpec,
    KeyModifiers, NicSpec, UsbScanCode,
};
pub use vm::{PowerState, VAppPropertyInfo, VirtualMachine};
