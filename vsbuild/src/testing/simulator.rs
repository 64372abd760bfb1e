//! An in-memory management plane.
//!
//! [`SimulatedApi`] keeps a small vcsim-like inventory and applies submitted
//! operations to it synchronously: every task is already finished when
//! `task_info` is first asked. Call counters and failure switches let tests
//! observe and perturb what the driver does.

use crate::cancellation::CancellationToken;
use crate::driver::devices::{DeviceList, VirtualDevice};
use crate::driver::spec::{DeviceChange, DeviceOperation};
use crate::driver::{
    CatalogSession, Credentials, Driver, DriverSettings, LibraryInfo, LibraryItemInfo,
    ManagedObjectRef, ManagementApi, ObjectKind, Operation, PlacementRequest, PropertyMap,
    PublishEvent, SessionId, TaskInfo, TaskRef, TaskState,
};
use crate::errors::RemoteError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const IDE_CONTROLLER_KEY: i32 = 200;

#[derive(Debug, Clone)]
struct SimObject {
    seq: usize,
    props: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct Inventory {
    objects: DashMap<ManagedObjectRef, SimObject>,
    next_id: AtomicUsize,
    files: Mutex<BTreeSet<(String, String)>>,
    tasks: DashMap<String, TaskInfo>,
    submitted: Mutex<Vec<Operation>>,
    deleted: Mutex<Vec<String>>,
    recommendations: Mutex<Vec<String>>,
    failing_properties: Mutex<HashSet<String>>,
    libraries: Mutex<Vec<LibraryInfo>>,
    library_items: Mutex<Vec<LibraryItemInfo>>,
    publish_events: Mutex<Vec<PublishEvent>>,
    recommendation_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    catalog_logout_calls: AtomicUsize,
    fail_catalog_logout: AtomicBool,
    ignore_guest_shutdown: AtomicBool,
}

/// A [`ManagementApi`] backed by an in-memory inventory.
///
/// The default inventory holds datacenter `dc1`, the root VM folder `vm`,
/// cluster `cluster1` with root pool `Resources`, hosts `esxi-1` and
/// `esxi-2`, datastores `datastore1`, `ds-a` and `ds-b`, the datastore
/// cluster `dsc1` (members `ds-a`, `ds-b`), the network `VM Network`, and
/// two networks named `pg-build`, one visible on each host.
///
/// Clones share the inventory.
#[derive(Debug, Clone)]
pub struct SimulatedApi {
    inner: Arc<Inventory>,
}

impl Default for SimulatedApi {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedApi {
    /// Creates a simulator with the default inventory.
    #[must_use]
    pub fn new() -> Self {
        let sim = Self {
            inner: Arc::new(Inventory::default()),
        };
        sim.seed();
        sim
    }

    fn seed(&self) {
        self.add_object(ObjectKind::Datacenter, "dc1", BTreeMap::new());
        self.add_object(ObjectKind::Folder, "vm", BTreeMap::new());

        let pool = self.add_object(ObjectKind::ResourcePool, "Resources", BTreeMap::new());
        let datastore1 = self.add_object(ObjectKind::Datastore, "datastore1", BTreeMap::new());
        let ds_a = self.add_object(ObjectKind::Datastore, "ds-a", BTreeMap::new());
        let ds_b = self.add_object(ObjectKind::Datastore, "ds-b", BTreeMap::new());
        self.add_object(
            ObjectKind::StoragePod,
            "dsc1",
            BTreeMap::from([("childEntity".to_string(), json!([ds_a, ds_b]))]),
        );

        let esxi1 = ManagedObjectRef::new(ObjectKind::Host, "host-1");
        let esxi2 = ManagedObjectRef::new(ObjectKind::Host, "host-2");
        let vm_network = self.add_object(
            ObjectKind::Network,
            "VM Network",
            BTreeMap::from([("host".to_string(), json!([esxi1, esxi2]))]),
        );
        let pg_build_1 = self.add_object(
            ObjectKind::Network,
            "pg-build",
            BTreeMap::from([("host".to_string(), json!([esxi1]))]),
        );
        let pg_build_2 = self.add_object(
            ObjectKind::Network,
            "pg-build",
            BTreeMap::from([("host".to_string(), json!([esxi2]))]),
        );

        for (reference, name, networks) in [
            (esxi1.clone(), "esxi-1", json!([vm_network, pg_build_1])),
            (esxi2.clone(), "esxi-2", json!([vm_network, pg_build_2])),
        ] {
            self.insert(
                reference,
                BTreeMap::from([
                    ("name".to_string(), json!(name)),
                    ("resourcePool".to_string(), json!(pool)),
                    ("network".to_string(), networks),
                    ("datastore".to_string(), json!([datastore1, ds_a, ds_b])),
                ]),
            );
        }

        self.add_object(
            ObjectKind::Cluster,
            "cluster1",
            BTreeMap::from([
                ("resourcePool".to_string(), json!(pool)),
                ("host".to_string(), json!([esxi1, esxi2])),
            ]),
        );
    }

    /// Connects a driver with fast task polling and datacenter `dc1`.
    ///
    /// # Panics
    ///
    /// Panics if the simulated login fails, which only happens when the
    /// default inventory was tampered with.
    pub async fn connect(&self) -> Driver {
        Driver::connect(
            Arc::new(self.clone()),
            Credentials {
                server: "vcsim.local".into(),
                username: "builder".into(),
                password: "builder".into(),
                insecure: true,
            },
            Some("dc1"),
            DriverSettings {
                task_poll_interval: Duration::from_millis(10),
                task_timeout: Duration::from_secs(60),
            },
            Arc::new(CancellationToken::new()),
        )
        .await
        .expect("simulated login")
    }

    /// Adds a powered-off VM (or template) with one 16 GiB disk on
    /// `datastore1`, an IDE controller and a NIC on `VM Network`.
    pub fn add_vm(&self, name: &str, template: bool) -> ManagedObjectRef {
        let datastore = self.lookup(ObjectKind::Datastore, "datastore1");
        let network = self.lookup(ObjectKind::Network, "VM Network");
        let devices = DeviceList(vec![
            VirtualDevice::Controller {
                key: IDE_CONTROLLER_KEY,
                controller_type: "ide".into(),
                bus_number: 0,
            },
            VirtualDevice::Controller {
                key: 1000,
                controller_type: "pvscsi".into(),
                bus_number: 0,
            },
            VirtualDevice::Disk {
                key: 2000,
                controller_key: 1000,
                capacity_kb: 16 * 1024 * 1024,
                file_name: Some(format!("[datastore1] {name}/{name}.vmdk")),
                thin_provisioned: true,
            },
            VirtualDevice::Ethernet {
                key: 4000,
                network: "VM Network".into(),
                adapter_type: "vmxnet3".into(),
                mac_address: None,
            },
        ]);
        let props = self.vm_props(
            name,
            template,
            &devices,
            json!([datastore]),
            json!([network]),
            2,
            4096,
            "",
        );
        self.add_object(ObjectKind::VirtualMachine, name, props)
    }

    /// Returns true if a VM named `name` exists.
    #[must_use]
    pub fn vm_exists(&self, name: &str) -> bool {
        self.find_by_name(ObjectKind::VirtualMachine, name).next().is_some()
    }

    /// Replaces the datastores and networks a VM reports.
    pub fn set_vm_backing(&self, vm: &str, datastores: &[&str], networks: &[&str]) {
        let datastores: Vec<_> = datastores
            .iter()
            .map(|n| self.lookup(ObjectKind::Datastore, n))
            .collect();
        let networks: Vec<_> = networks
            .iter()
            .map(|n| self.lookup(ObjectKind::Network, n))
            .collect();
        self.update_vm(vm, |props| {
            props.insert("datastore".into(), json!(datastores));
            props.insert("network".into(), json!(networks));
        });
    }

    /// Sets the address guest tools report.
    pub fn set_guest_ip(&self, vm: &str, ip: Option<&str>) {
        self.update_vm(vm, |props| {
            props.insert("guest.ipAddress".into(), json!(ip));
        });
    }

    /// Powers a VM off out of band, as a guest shutting itself down would.
    pub fn power_off_vm(&self, vm: &str) {
        self.update_vm(vm, |props| {
            props.insert("runtime.powerState".into(), json!("poweredOff"));
        });
    }

    /// Makes guest shutdown requests succeed without stopping the VM.
    pub fn ignore_guest_shutdown(&self) {
        self.inner.ignore_guest_shutdown.store(true, Ordering::SeqCst);
    }

    /// Makes every read of `path` fail.
    pub fn fail_property(&self, path: &str) {
        self.inner.failing_properties.lock().insert(path.to_string());
    }

    /// Sets the datastores placement recommendations return, best first.
    pub fn recommend(&self, datastores: &[&str]) {
        *self.inner.recommendations.lock() = datastores.iter().map(|d| (*d).to_string()).collect();
    }

    /// Number of placement recommendation requests.
    #[must_use]
    pub fn recommendation_calls(&self) -> usize {
        self.inner.recommendation_calls.load(Ordering::SeqCst)
    }

    /// Creates a file on a datastore.
    pub fn put_file(&self, datastore: &str, path: &str) {
        self.inner
            .files
            .lock()
            .insert((datastore.to_string(), path.to_string()));
    }

    /// Returns true if the datastore path exists.
    #[must_use]
    pub fn file_exists(&self, datastore: &str, path: &str) -> bool {
        self.inner
            .files
            .lock()
            .contains(&(datastore.to_string(), path.to_string()))
    }

    /// Number of file uploads.
    #[must_use]
    pub fn upload_calls(&self) -> usize {
        self.inner.upload_calls.load(Ordering::SeqCst)
    }

    /// Deleted files as `[datastore] path`, in deletion order.
    #[must_use]
    pub fn deleted_files(&self) -> Vec<String> {
        self.inner.deleted.lock().clone()
    }

    /// Number of main-session logouts.
    #[must_use]
    pub fn logout_calls(&self) -> usize {
        self.inner.logout_calls.load(Ordering::SeqCst)
    }

    /// Number of catalog-session logouts, failed ones included.
    #[must_use]
    pub fn catalog_logout_calls(&self) -> usize {
        self.inner.catalog_logout_calls.load(Ordering::SeqCst)
    }

    /// Makes catalog logouts fail.
    pub fn fail_catalog_logout(&self) {
        self.inner.fail_catalog_logout.store(true, Ordering::SeqCst);
    }

    /// Adds a content library backed by the named datastores.
    pub fn add_library(&self, name: &str, datastores: &[&str]) {
        let id = format!("library-{}", self.next_id());
        self.inner.libraries.lock().push(LibraryInfo {
            id,
            name: name.to_string(),
            datastores: datastores.iter().map(|d| (*d).to_string()).collect(),
        });
    }

    /// Items imported into libraries.
    #[must_use]
    pub fn library_items(&self) -> Vec<LibraryItemInfo> {
        self.inner.library_items.lock().clone()
    }

    /// Sets the events a publish watch yields.
    ///
    /// The watch stays open after the last event, so a list without a
    /// terminal event keeps the publish waiting.
    pub fn publish_events(&self, events: Vec<PublishEvent>) {
        *self.inner.publish_events.lock() = events;
    }

    /// Returns true if `network` is visible on the host named `host`.
    #[must_use]
    pub fn network_visible_on(&self, network: &ManagedObjectRef, host: &str) -> bool {
        let host = self.lookup(ObjectKind::Host, host);
        self.prop(&host, "network")
            .and_then(|v| serde_json::from_value::<Vec<ManagedObjectRef>>(v).ok())
            .is_some_and(|networks| networks.contains(network))
    }

    /// Every submitted operation, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<Operation> {
        self.inner.submitted.lock().clone()
    }

    fn next_id(&self) -> usize {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn insert(&self, reference: ManagedObjectRef, props: BTreeMap<String, Value>) {
        let seq = self.next_id();
        self.inner.objects.insert(reference, SimObject { seq, props });
    }

    fn add_object(
        &self,
        kind: ObjectKind,
        name: &str,
        mut props: BTreeMap<String, Value>,
    ) -> ManagedObjectRef {
        let prefix = match kind {
            ObjectKind::Datacenter => "datacenter",
            ObjectKind::Folder => "group",
            ObjectKind::Cluster => "domain",
            ObjectKind::Host => "host",
            ObjectKind::ResourcePool => "resgroup",
            ObjectKind::Datastore => "datastore",
            ObjectKind::StoragePod => "group-p",
            ObjectKind::Network => "network",
            ObjectKind::VirtualMachine => "vm",
        };
        let reference = ManagedObjectRef::new(kind, format!("{prefix}-{}", self.next_id()));
        props.insert("name".into(), json!(name));
        self.insert(reference.clone(), props);
        reference
    }

    fn find_by_name<'a>(
        &'a self,
        kind: ObjectKind,
        name: &'a str,
    ) -> impl Iterator<Item = ManagedObjectRef> + 'a {
        let mut found: Vec<(usize, ManagedObjectRef)> = self
            .inner
            .objects
            .iter()
            .filter(|entry| {
                entry.key().kind == kind
                    && entry.value().props.get("name").and_then(Value::as_str) == Some(name)
            })
            .map(|entry| (entry.value().seq, entry.key().clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, reference)| reference)
    }

    fn lookup(&self, kind: ObjectKind, name: &str) -> ManagedObjectRef {
        self.find_by_name(kind, name)
            .next()
            .unwrap_or_else(|| ManagedObjectRef::new(kind, format!("missing-{name}")))
    }

    fn prop(&self, object: &ManagedObjectRef, path: &str) -> Option<Value> {
        self.inner
            .objects
            .get(object)
            .and_then(|o| o.props.get(path).cloned())
    }

    fn name_of(&self, object: &ManagedObjectRef) -> Option<String> {
        self.prop(object, "name")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn update_vm(&self, name: &str, apply: impl FnOnce(&mut BTreeMap<String, Value>)) {
        let Some(reference) = self.find_by_name(ObjectKind::VirtualMachine, name).next() else {
            return;
        };
        if let Some(mut object) = self.inner.objects.get_mut(&reference) {
            apply(&mut object.props);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn vm_props(
        &self,
        name: &str,
        template: bool,
        devices: &DeviceList,
        datastores: Value,
        networks: Value,
        num_cpu: i32,
        memory_mb: i64,
        annotation: &str,
    ) -> BTreeMap<String, Value> {
        let pool = self.lookup(ObjectKind::ResourcePool, "Resources");
        let host = self.lookup(ObjectKind::Host, "esxi-1");
        BTreeMap::from([
            ("config.hardware.device".to_string(), json!(devices)),
            ("runtime.powerState".to_string(), json!("poweredOff")),
            ("config.template".to_string(), json!(template)),
            ("guest.ipAddress".to_string(), Value::Null),
            ("config.vAppConfig.property".to_string(), json!([])),
            ("config.uuid".to_string(), json!(uuid::Uuid::new_v4().to_string())),
            ("config.annotation".to_string(), json!(annotation)),
            ("config.hardware.numCPU".to_string(), json!(num_cpu)),
            ("config.hardware.memoryMB".to_string(), json!(memory_mb)),
            ("resourcePool".to_string(), json!(pool)),
            ("datastore".to_string(), datastores),
            ("network".to_string(), networks),
            ("summary.runtime.host".to_string(), json!(host)),
            ("name".to_string(), json!(name)),
        ])
    }

    fn vm_mut<T>(
        &self,
        vm: &ManagedObjectRef,
        apply: impl FnOnce(&mut BTreeMap<String, Value>) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut object = self
            .inner
            .objects
            .get_mut(vm)
            .ok_or_else(|| RemoteError::not_found(format!("{vm} has been deleted")))?;
        apply(&mut object.props)
    }

    fn apply(&self, operation: &Operation) -> Result<Option<Value>, RemoteError> {
        match operation {
            Operation::CreateVm {
                resource_pool,
                host,
                spec,
                ..
            } => {
                if self.vm_exists(&spec.name) {
                    return Err(RemoteError::invalid_argument(format!(
                        "The name '{}' already exists.",
                        spec.name
                    )));
                }
                let mut devices = vec![VirtualDevice::Controller {
                    key: IDE_CONTROLLER_KEY,
                    controller_type: "ide".into(),
                    bus_number: 0,
                }];
                for (index, controller) in spec.disk_controllers.iter().enumerate() {
                    devices.push(VirtualDevice::Controller {
                        key: 1000 + index as i32,
                        controller_type: controller.clone(),
                        bus_number: index as i32,
                    });
                }
                let mut datastores = Vec::new();
                for (index, disk) in spec.disks.iter().enumerate() {
                    let ds_name = self.name_of(&disk.datastore).unwrap_or_default();
                    devices.push(VirtualDevice::Disk {
                        key: 2000 + index as i32,
                        controller_key: 1000 + disk.controller_index as i32,
                        capacity_kb: disk.size_mb * 1024,
                        file_name: Some(format!("[{ds_name}] {0}/{0}_{index}.vmdk", spec.name)),
                        thin_provisioned: disk.thin_provisioned,
                    });
                    if !datastores.contains(&disk.datastore) {
                        datastores.push(disk.datastore.clone());
                    }
                }
                if datastores.is_empty() {
                    datastores.push(spec.datastore.clone());
                }
                let mut networks = Vec::new();
                for (index, nic) in spec.nics.iter().enumerate() {
                    devices.push(VirtualDevice::Ethernet {
                        key: 4000 + index as i32,
                        network: self.name_of(&nic.network).unwrap_or_default(),
                        adapter_type: nic.adapter_type.clone(),
                        mac_address: nic.mac_address.clone(),
                    });
                    networks.push(nic.network.clone());
                }
                let mut props = self.vm_props(
                    &spec.name,
                    false,
                    &DeviceList(devices),
                    json!(datastores),
                    json!(networks),
                    spec.num_cpus,
                    spec.memory_mb,
                    spec.annotation.as_deref().unwrap_or_default(),
                );
                props.insert("resourcePool".into(), json!(resource_pool));
                if let Some(host) = host {
                    props.insert("summary.runtime.host".into(), json!(host));
                }
                let reference = self.add_object(ObjectKind::VirtualMachine, &spec.name, props);
                Ok(Some(json!(reference)))
            }
            Operation::CloneVm { source, spec } => {
                if self.vm_exists(&spec.name) {
                    return Err(RemoteError::invalid_argument(format!(
                        "The name '{}' already exists.",
                        spec.name
                    )));
                }
                let mut props = self
                    .inner
                    .objects
                    .get(source)
                    .map(|o| o.props.clone())
                    .ok_or_else(|| RemoteError::not_found(format!("{source} has been deleted")))?;
                props.insert("config.template".into(), json!(false));
                props.insert("runtime.powerState".into(), json!("poweredOff"));
                props.insert("guest.ipAddress".into(), Value::Null);
                props.insert("config.uuid".into(), json!(uuid::Uuid::new_v4().to_string()));
                props.insert("resourcePool".into(), json!(spec.resource_pool));
                if let Some(datastore) = &spec.datastore {
                    props.insert("datastore".into(), json!([datastore]));
                }
                if let Some(network) = &spec.network {
                    props.insert("network".into(), json!([network]));
                }
                if let Some(host) = &spec.host {
                    props.insert("summary.runtime.host".into(), json!(host));
                }
                if let Some(notes) = &spec.annotation {
                    props.insert("config.annotation".into(), json!(notes));
                }
                let reference = self.add_object(ObjectKind::VirtualMachine, &spec.name, props);
                Ok(Some(json!(reference)))
            }
            Operation::Reconfigure { vm, spec } => self.vm_mut(vm, |props| {
                if let Some(cpus) = spec.num_cpus {
                    props.insert("config.hardware.numCPU".into(), json!(cpus));
                }
                if let Some(memory) = spec.memory_mb {
                    props.insert("config.hardware.memoryMB".into(), json!(memory));
                }
                if let Some(notes) = &spec.annotation {
                    props.insert("config.annotation".into(), json!(notes));
                }
                if !spec.device_changes.is_empty() {
                    let current = props.get("config.hardware.device").cloned().unwrap_or(Value::Null);
                    let mut devices: DeviceList = serde_json::from_value(current)
                        .map_err(|e| RemoteError::invalid_state(e.to_string()))?;
                    for change in &spec.device_changes {
                        apply_device_change(&mut devices, change)?;
                    }
                    props.insert("config.hardware.device".into(), json!(devices));
                }
                Ok(None)
            }),
            Operation::PowerOn { vm } => self.vm_mut(vm, |props| {
                if props.get("config.template") == Some(&json!(true)) {
                    return Err(RemoteError::invalid_state("A template cannot be powered on."));
                }
                set_power(props, "poweredOn")
            }),
            Operation::PowerOff { vm } => self.vm_mut(vm, |props| set_power(props, "poweredOff")),
            Operation::ShutdownGuest { vm } => {
                let ignore = self.inner.ignore_guest_shutdown.load(Ordering::SeqCst);
                self.vm_mut(vm, |props| {
                    if props.get("runtime.powerState") != Some(&json!("poweredOn")) {
                        return Err(RemoteError::invalid_state(
                            "The operation is not allowed in the current state (Powered off).",
                        ));
                    }
                    if !ignore {
                        props.insert("runtime.powerState".into(), json!("poweredOff"));
                    }
                    Ok(None)
                })
            }
            Operation::PutUsbScanCodes { vm, codes } => {
                self.vm_mut(vm, |_| Ok(Some(json!(codes.len()))))
            }
            Operation::CreateSnapshot { vm, name, .. } => self.vm_mut(vm, |props| {
                props.insert("snapshot.currentSnapshot".into(), json!(name));
                Ok(None)
            }),
            Operation::MarkAsTemplate { vm } => self.vm_mut(vm, |props| {
                if props.get("runtime.powerState") != Some(&json!("poweredOff")) {
                    return Err(RemoteError::invalid_state(
                        "The attempted operation cannot be performed in the current state (Powered on).",
                    ));
                }
                props.insert("config.template".into(), json!(true));
                Ok(None)
            }),
            Operation::RemoveSnapshot { vm, name } => self.vm_mut(vm, |props| {
                if props.get("snapshot.currentSnapshot") != Some(&json!(name)) {
                    return Err(RemoteError::not_found(format!("snapshot '{name}' not found")));
                }
                props.remove("snapshot.currentSnapshot");
                Ok(None)
            }),
            Operation::MarkAsVirtualMachine { vm, resource_pool } => self.vm_mut(vm, |props| {
                if props.get("config.template") != Some(&json!(true)) {
                    return Err(RemoteError::invalid_state(
                        "The operation is not supported on the object.",
                    ));
                }
                props.insert("config.template".into(), json!(false));
                props.insert("resourcePool".into(), json!(resource_pool));
                Ok(None)
            }),
            Operation::Destroy { vm } => {
                self.inner
                    .objects
                    .remove(vm)
                    .ok_or_else(|| RemoteError::not_found(format!("{vm} has been deleted")))?;
                Ok(None)
            }
            Operation::MakeDirectory { datastore, path } => {
                let name = self.datastore_name(datastore)?;
                self.put_file(&name, path);
                Ok(None)
            }
            Operation::DeleteFile { datastore, path } => {
                let name = self.datastore_name(datastore)?;
                if !self.inner.files.lock().remove(&(name.clone(), path.clone())) {
                    return Err(RemoteError::not_found(format!("File [{name}] {path} was not found")));
                }
                self.inner.deleted.lock().push(format!("[{name}] {path}"));
                Ok(None)
            }
            Operation::ImportToLibrary {
                vm,
                library_id,
                spec,
                ..
            } => {
                if !self.inner.objects.contains_key(vm) {
                    return Err(RemoteError::not_found(format!("{vm} has been deleted")));
                }
                let id = uuid::Uuid::new_v4().to_string();
                self.inner.library_items.lock().push(LibraryItemInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    library_id: library_id.clone(),
                    item_type: if spec.ovf { "ovf" } else { "vm-template" }.into(),
                });
                Ok(Some(json!(id)))
            }
            Operation::PublishLibraryItem { item_id, .. } => {
                let known = self.inner.library_items.lock().iter().any(|i| &i.id == item_id);
                if known {
                    Ok(None)
                } else {
                    Err(RemoteError::not_found(format!("library item {item_id} not found")))
                }
            }
            Operation::DeleteLibraryItem { item_id, .. } => {
                let mut items = self.inner.library_items.lock();
                let before = items.len();
                items.retain(|i| &i.id != item_id);
                if items.len() == before {
                    return Err(RemoteError::not_found(format!("library item {item_id} not found")));
                }
                Ok(None)
            }
        }
    }

    fn datastore_name(&self, datastore: &ManagedObjectRef) -> Result<String, RemoteError> {
        self.name_of(datastore)
            .ok_or_else(|| RemoteError::not_found(format!("{datastore} not found")))
    }
}

fn set_power(props: &mut BTreeMap<String, Value>, target: &str) -> Result<Option<Value>, RemoteError> {
    if props.get("runtime.powerState") == Some(&json!(target)) {
        return Err(RemoteError::invalid_state(
            "The attempted operation cannot be performed in the current state.",
        ));
    }
    props.insert("runtime.powerState".into(), json!(target));
    Ok(None)
}

fn apply_device_change(devices: &mut DeviceList, change: &DeviceChange) -> Result<(), RemoteError> {
    let key = change.device.key();
    match change.operation {
        DeviceOperation::Add => {
            let next = devices.0.iter().map(VirtualDevice::key).max().unwrap_or(0).max(0) + 1;
            let mut device = change.device.clone();
            set_key(&mut device, next);
            devices.0.push(device);
        }
        DeviceOperation::Edit => {
            let slot = devices
                .0
                .iter_mut()
                .find(|d| d.key() == key)
                .ok_or_else(|| RemoteError::invalid_argument(format!("no device with key {key}")))?;
            *slot = change.device.clone();
        }
        DeviceOperation::Remove => {
            let before = devices.0.len();
            devices.0.retain(|d| d.key() != key);
            if devices.0.len() == before {
                return Err(RemoteError::invalid_argument(format!("no device with key {key}")));
            }
        }
    }
    Ok(())
}

fn set_key(device: &mut VirtualDevice, new_key: i32) {
    match device {
        VirtualDevice::Disk { key, .. }
        | VirtualDevice::Cdrom { key, .. }
        | VirtualDevice::Floppy { key, .. }
        | VirtualDevice::Ethernet { key, .. }
        | VirtualDevice::Controller { key, .. }
        | VirtualDevice::Other { key, .. } => *key = new_key,
    }
}

#[async_trait]
impl ManagementApi for SimulatedApi {
    async fn login(&self, credentials: &Credentials) -> Result<SessionId, RemoteError> {
        if credentials.username.is_empty() {
            return Err(RemoteError::authentication("Cannot complete login due to an incorrect user name or password."));
        }
        Ok(SessionId(format!("session-{}", self.next_id())))
    }

    async fn logout(&self, _session: &SessionId) -> Result<(), RemoteError> {
        self.inner.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find(&self, kind: ObjectKind, name: &str) -> Result<Vec<ManagedObjectRef>, RemoteError> {
        Ok(self.find_by_name(kind, name).collect())
    }

    async fn retrieve_properties(
        &self,
        object: &ManagedObjectRef,
        paths: &[String],
    ) -> Result<PropertyMap, RemoteError> {
        {
            let failing = self.inner.failing_properties.lock();
            if let Some(path) = paths.iter().find(|p| failing.contains(*p)) {
                return Err(RemoteError::invalid_state(format!(
                    "property '{path}' is not readable"
                )));
            }
        }
        let entry = self
            .inner
            .objects
            .get(object)
            .ok_or_else(|| RemoteError::not_found(format!("{object} has been deleted")))?;
        let props = &entry.value().props;
        Ok(if paths.is_empty() {
            props.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        } else {
            paths
                .iter()
                .filter_map(|p| props.get(p).map(|v| (p.clone(), v.clone())))
                .collect()
        })
    }

    async fn submit(&self, operation: Operation) -> Result<TaskRef, RemoteError> {
        self.inner.submitted.lock().push(operation.clone());
        let id = format!("task-{}", self.next_id());
        let info = match self.apply(&operation) {
            Ok(result) => TaskInfo {
                state: TaskState::Success,
                result,
                error: None,
                progress: Some(100),
            },
            Err(e) => TaskInfo {
                state: TaskState::Error,
                result: None,
                error: Some(e.message),
                progress: None,
            },
        };
        self.inner.tasks.insert(id.clone(), info);
        Ok(TaskRef {
            id,
            description: operation.name().to_string(),
        })
    }

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo, RemoteError> {
        self.inner
            .tasks
            .get(&task.id)
            .map(|t| t.value().clone())
            .ok_or_else(|| RemoteError::not_found(format!("task {} not found", task.id)))
    }

    async fn recommend_datastores(
        &self,
        _request: &PlacementRequest,
    ) -> Result<Vec<ManagedObjectRef>, RemoteError> {
        self.inner.recommendation_calls.fetch_add(1, Ordering::SeqCst);
        let names = self.inner.recommendations.lock().clone();
        Ok(names
            .iter()
            .filter_map(|n| self.find_by_name(ObjectKind::Datastore, n).next())
            .collect())
    }

    async fn file_exists(&self, datastore: &ManagedObjectRef, path: &str) -> Result<bool, RemoteError> {
        let name = self.datastore_name(datastore)?;
        Ok(SimulatedApi::file_exists(self, &name, path))
    }

    async fn upload_file(
        &self,
        datastore: &ManagedObjectRef,
        _local: &Path,
        remote_path: &str,
        _host: Option<ManagedObjectRef>,
    ) -> Result<(), RemoteError> {
        let name = self.datastore_name(datastore)?;
        self.inner.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.put_file(&name, remote_path);
        Ok(())
    }

    async fn catalog_login(&self, _credentials: &Credentials) -> Result<CatalogSession, RemoteError> {
        Ok(CatalogSession(format!("catalog-{}", self.next_id())))
    }

    async fn catalog_logout(&self, _session: &CatalogSession) -> Result<(), RemoteError> {
        self.inner.catalog_logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_catalog_logout.load(Ordering::SeqCst) {
            return Err(RemoteError::invalid_state("catalog session already expired"));
        }
        Ok(())
    }

    async fn find_library(
        &self,
        _session: &CatalogSession,
        name: &str,
    ) -> Result<Option<LibraryInfo>, RemoteError> {
        Ok(self
            .inner
            .libraries
            .lock()
            .iter()
            .find(|l| l.name == name)
            .cloned())
    }

    async fn find_library_item(
        &self,
        _session: &CatalogSession,
        library_id: &str,
        name: &str,
    ) -> Result<Option<LibraryItemInfo>, RemoteError> {
        Ok(self
            .inner
            .library_items
            .lock()
            .iter()
            .find(|i| i.library_id == library_id && i.name == name)
            .cloned())
    }

    async fn watch_publish(
        &self,
        _session: &CatalogSession,
        _item_id: &str,
    ) -> Result<BoxStream<'static, PublishEvent>, RemoteError> {
        let events = self.inner.publish_events.lock().clone();
        Ok(stream::iter(events).chain(stream::pending()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_inventory_is_resolvable() {
        let sim = SimulatedApi::new();
        let driver = sim.connect().await;

        assert!(driver.datacenter().is_some());
        assert_eq!(driver.find_all(ObjectKind::Network, "pg-build").await.unwrap().len(), 2);
        let pod = driver.find_storage_pod("dsc1").await.unwrap();
        let members: Vec<String> = pod
            .members()
            .await
            .unwrap()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(members, vec!["ds-a", "ds-b"]);
    }

    #[tokio::test]
    async fn test_reconfigure_assigns_keys_to_new_devices() {
        let sim = SimulatedApi::new();
        let vm_ref = sim.add_vm("ubuntu", false);
        let vm = sim.connect().await.vm(vm_ref);

        vm.add_floppy(Some("[datastore1] a.flp")).await.unwrap();

        let devices = vm.devices().await.unwrap();
        let floppy = devices.floppies().next().unwrap();
        assert!(floppy.key() > 0);
    }

    #[tokio::test]
    async fn test_failed_task_reports_remote_message() {
        let sim = SimulatedApi::new();
        let vm_ref = sim.add_vm("ubuntu", false);
        let vm = sim.connect().await.vm(vm_ref);
        vm.power_on().await.unwrap();

        let err = vm.convert_to_template().await.unwrap_err();

        assert!(err.to_string().contains("current state"));
        assert_eq!(sim.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_template_round_trip_and_snapshot_removal() {
        let sim = SimulatedApi::new();
        let vm_ref = sim.add_vm("ubuntu", false);
        let driver = sim.connect().await;
        let vm = driver.vm(vm_ref);
        let pool = driver.find_resource_pool("Resources").await.unwrap();

        vm.create_snapshot("base", "").await.unwrap();
        vm.remove_snapshot("base").await.unwrap();
        let err = vm.remove_snapshot("base").await.unwrap_err();
        assert!(err.to_string().contains("snapshot 'base' not found"));

        vm.convert_to_template().await.unwrap();
        assert!(vm.is_template().await.unwrap());
        vm.mark_as_virtual_machine(&pool).await.unwrap();
        assert!(!vm.is_template().await.unwrap());
        assert!(vm.mark_as_virtual_machine(&pool).await.is_err());
    }
}
