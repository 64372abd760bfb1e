//! Label metadata describing a built VM.
//!
//! Each item is read with its own property request so one unreadable
//! property does not hide the rest. Unreadable items are logged and left
//! out. Multi-valued items are numbered: the first value is written under
//! the plain key (`datastore`), later ones as `datastore_1`, `datastore_2`.

use crate::core::LibraryDestination;
use crate::driver::{ManagedObjectRef, VirtualMachine};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use tracing::warn;

/// Label key of the content library destination.
pub const CONTENT_LIBRARY_DESTINATION: &str = "content_library_destination";

/// Reads the metadata of `vm` into a fresh label map.
pub async fn collect_vm_metadata(vm: &VirtualMachine) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    LabelWriter::new(&mut labels).write_vm_info(vm).await;
    labels
}

/// Writes labels into an existing map. Later writes replace earlier ones.
#[derive(Debug)]
pub struct LabelWriter<'a> {
    labels: &'a mut BTreeMap<String, String>,
}

impl<'a> LabelWriter<'a> {
    /// Creates a writer over `labels`.
    pub fn new(labels: &'a mut BTreeMap<String, String>) -> Self {
        Self { labels }
    }

    /// Sets one label.
    pub fn write(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    /// Copies every entry of `labels`, replacing existing keys.
    pub fn extend(&mut self, labels: &BTreeMap<String, String>) {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Records where the VM was captured in a content library.
    pub fn write_content_library(&mut self, destination: &LibraryDestination) {
        self.write(CONTENT_LIBRARY_DESTINATION, destination.to_string());
    }

    /// Reads the structural metadata of `vm`.
    pub async fn write_vm_info(&mut self, vm: &VirtualMachine) {
        if let Some(uuid) = read::<String>(vm, "config.uuid").await {
            self.write("vm_uuid", uuid);
        }
        if let Some(notes) = read::<String>(vm, "config.annotation").await.filter(|n| !n.is_empty()) {
            self.write("annotation", notes);
        }
        if let Some(cpus) = read::<i64>(vm, "config.hardware.numCPU").await {
            self.write("num_cpu", cpus.to_string());
        }
        if let Some(memory) = read::<i64>(vm, "config.hardware.memoryMB").await {
            self.write("memory_mb", memory.to_string());
        }
        if let Some(pool) = read::<ManagedObjectRef>(vm, "resourcePool").await {
            if let Some(name) = name_of(vm, &pool).await {
                self.write("resource_pool", name);
            }
        }
        if let Some(datastores) = read::<Vec<ManagedObjectRef>>(vm, "datastore").await {
            self.write_indexed(vm, "datastore", &datastores).await;
        }
        if let Some(networks) = read::<Vec<ManagedObjectRef>>(vm, "network").await {
            self.write_indexed(vm, "network", &networks).await;
        }
        if let Some(host) = read::<ManagedObjectRef>(vm, "summary.runtime.host").await {
            if let Some(name) = name_of(vm, &host).await {
                self.write("host", name);
            }
        }
        if let Some(template) = read::<bool>(vm, "config.template").await {
            self.write("template", template.to_string());
        }
    }

    async fn write_indexed(&mut self, vm: &VirtualMachine, key: &str, objects: &[ManagedObjectRef]) {
        let mut index = 0;
        for object in objects {
            let Some(name) = name_of(vm, object).await else {
                continue;
            };
            let label = if index == 0 {
                key.to_string()
            } else {
                format!("{key}_{index}")
            };
            self.write(label, name);
            index += 1;
        }
    }
}

async fn read<T: DeserializeOwned>(vm: &VirtualMachine, path: &str) -> Option<T> {
    match vm.driver().property::<Option<T>>(vm.reference(), path).await {
        Ok(value) => value,
        Err(e) => {
            warn!(vm = %vm.reference(), property = path, error = %e, "skipping metadata item");
            None
        }
    }
}

async fn name_of(vm: &VirtualMachine, object: &ManagedObjectRef) -> Option<String> {
    match vm.driver().object_name(object).await {
        Ok(name) => Some(name),
        Err(e) => {
            warn!(object = %object, error = %e, "skipping metadata item");
            None
        }
    }
}
