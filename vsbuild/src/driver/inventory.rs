//! Handles for non-VM inventory objects.

use super::api::{ManagedObjectRef, Operation};
use super::client::Driver;
use crate::errors::BuildResult;
use crate::utils::DatastorePath;
use std::path::Path;
use tracing::debug;

macro_rules! object_accessors {
    ($name:ident) => {
        impl $name {
            /// The managed object reference.
            #[must_use]
            pub fn reference(&self) -> &ManagedObjectRef {
                &self.reference
            }

            /// The name or inventory path used to find this object.
            #[must_use]
            pub fn name(&self) -> &str {
                &self.name
            }
        }
    };
}

/// A handle that queries the remote object through the driver.
macro_rules! inventory_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            driver: Driver,
            reference: ManagedObjectRef,
            name: String,
        }

        impl $name {
            /// Wraps a reference whose name is already known.
            #[must_use]
            pub fn new(driver: Driver, reference: ManagedObjectRef, name: impl Into<String>) -> Self {
                Self {
                    driver,
                    reference,
                    name: name.into(),
                }
            }
        }

        object_accessors!($name);
    };
}

/// A named reference that is only ever passed to other operations.
macro_rules! inventory_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            reference: ManagedObjectRef,
            name: String,
        }

        impl $name {
            /// Wraps a reference whose name is already known.
            #[must_use]
            pub fn new(reference: ManagedObjectRef, name: impl Into<String>) -> Self {
                Self {
                    reference,
                    name: name.into(),
                }
            }
        }

        object_accessors!($name);
    };
}

inventory_handle!(
    /// A single datastore.
    Datastore
);
inventory_handle!(
    /// A datastore cluster.
    StoragePod
);
inventory_handle!(
    /// A network or port group.
    Network
);
inventory_handle!(
    /// An ESXi host.
    Host
);
inventory_handle!(
    /// A compute cluster.
    Cluster
);
inventory_ref!(
    /// A resource pool.
    ResourcePool
);
inventory_ref!(
    /// A VM folder.
    Folder
);

impl Datastore {
    /// Returns the `[name] path` form of a datastore-relative path.
    #[must_use]
    pub fn path(&self, relative: &str) -> DatastorePath {
        DatastorePath::new(&self.name, relative)
    }

    /// Checks whether a datastore-relative path exists.
    pub async fn file_exists(&self, relative: &str) -> BuildResult<bool> {
        Ok(self
            .driver
            .api()
            .file_exists(&self.reference, relative)
            .await?)
    }

    /// Creates a directory (and parents) on the datastore.
    pub async fn make_directory(&self, relative: &str) -> BuildResult<()> {
        self.driver
            .execute(Operation::MakeDirectory {
                datastore: self.reference.clone(),
                path: relative.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Streams a local file to a datastore-relative path.
    pub async fn upload(&self, local: &Path, relative: &str, host: Option<&Host>) -> BuildResult<()> {
        debug!(datastore = %self.name, local = %local.display(), remote = relative, "uploading file");
        self.driver
            .api()
            .upload_file(
                &self.reference,
                local,
                relative,
                host.map(|h| h.reference().clone()),
            )
            .await?;
        Ok(())
    }

    /// Deletes a datastore-relative file.
    pub async fn delete(&self, relative: &str) -> BuildResult<()> {
        self.driver
            .execute(Operation::DeleteFile {
                datastore: self.reference.clone(),
                path: relative.to_string(),
            })
            .await?;
        Ok(())
    }
}

impl StoragePod {
    /// Returns the member datastores in inventory order.
    pub async fn members(&self) -> BuildResult<Vec<Datastore>> {
        let refs: Vec<ManagedObjectRef> = self
            .driver
            .property(&self.reference, "childEntity")
            .await?;
        let mut members = Vec::with_capacity(refs.len());
        for reference in refs {
            members.push(self.driver.datastore(reference).await?);
        }
        Ok(members)
    }
}

impl Network {
    /// Hosts on which this network is visible.
    pub async fn hosts(&self) -> BuildResult<Vec<ManagedObjectRef>> {
        Ok(self
            .driver
            .property::<Option<Vec<ManagedObjectRef>>>(&self.reference, "host")
            .await?
            .unwrap_or_default())
    }
}

impl Host {
    /// Networks visible on this host.
    pub async fn networks(&self) -> BuildResult<Vec<ManagedObjectRef>> {
        Ok(self
            .driver
            .property::<Option<Vec<ManagedObjectRef>>>(&self.reference, "network")
            .await?
            .unwrap_or_default())
    }

    /// The root resource pool of the host's compute resource.
    pub async fn resource_pool(&self) -> BuildResult<ResourcePool> {
        let reference: ManagedObjectRef = self.driver.property(&self.reference, "resourcePool").await?;
        self.driver.resource_pool(reference).await
    }
}

impl Cluster {
    /// The cluster's root resource pool.
    pub async fn resource_pool(&self) -> BuildResult<ResourcePool> {
        let reference: ManagedObjectRef = self.driver.property(&self.reference, "resourcePool").await?;
        self.driver.resource_pool(reference).await
    }
}
