//! Datastore selection, direct or through a datastore cluster.

use crate::driver::{Datastore, Driver, ManagedObjectRef, PlacementRequest, StoragePod};
use crate::errors::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// What the user asked for. The two forms are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreTarget {
    /// A datastore by exact name.
    Direct(String),
    /// A datastore cluster by name.
    Group(String),
}

/// How the datastore in a [`ResolvedPlacement`] was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Named directly.
    Direct,
    /// Chosen by the placement service.
    Recommendation,
    /// The placement service had no opinion; first cluster member.
    Fallback,
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Recommendation => write!(f, "drs-recommendation"),
            Self::Fallback => write!(f, "fallback-first"),
        }
    }
}

/// Context for placement requests.
#[derive(Debug, Clone, Default)]
pub struct PlacementHints {
    /// Target resource pool.
    pub resource_pool: Option<ManagedObjectRef>,
    /// Target host.
    pub host: Option<ManagedObjectRef>,
    /// Name of the VM being placed.
    pub vm_name: String,
}

/// The chosen datastore and how it was chosen.
#[derive(Debug, Clone)]
pub struct ResolvedPlacement {
    /// The datastore to use.
    pub datastore: Datastore,
    /// Selection method.
    pub method: SelectionMethod,
    /// The cluster it came from, for group targets.
    pub group: Option<StoragePod>,
}

impl ResolvedPlacement {
    /// True when per-disk placement must ask the placement service again.
    #[must_use]
    pub fn needs_per_disk_placement(&self, disk_count: usize) -> bool {
        self.method == SelectionMethod::Recommendation && self.group.is_some() && disk_count > 1
    }
}

/// Resolves `target` to a concrete datastore.
///
/// A direct name that does not exist is an error. For a datastore cluster
/// the placement service is asked first; if it returns nothing, the first
/// member is used and the method is recorded as [`SelectionMethod::Fallback`].
pub async fn resolve_datastore(
    driver: &Driver,
    target: &DatastoreTarget,
    hints: &PlacementHints,
) -> BuildResult<ResolvedPlacement> {
    match target {
        DatastoreTarget::Direct(name) => {
            let datastore = driver.find_datastore(name).await?;
            debug!(datastore = name, "datastore resolved directly");
            Ok(ResolvedPlacement {
                datastore,
                method: SelectionMethod::Direct,
                group: None,
            })
        }
        DatastoreTarget::Group(name) => {
            let pod = driver.find_storage_pod(name).await?;
            let placement = match recommend(driver, &pod, hints, None).await? {
                Some(datastore) => ResolvedPlacement {
                    datastore,
                    method: SelectionMethod::Recommendation,
                    group: Some(pod),
                },
                None => {
                    let datastore = first_member(&pod).await?;
                    ResolvedPlacement {
                        datastore,
                        method: SelectionMethod::Fallback,
                        group: Some(pod),
                    }
                }
            };
            info!(
                datastore_cluster = name,
                datastore = placement.datastore.name(),
                method = %placement.method,
                "datastore selected from cluster"
            );
            Ok(placement)
        }
    }
}

async fn recommend(
    driver: &Driver,
    pod: &StoragePod,
    hints: &PlacementHints,
    disk_size_kb: Option<i64>,
) -> BuildResult<Option<Datastore>> {
    let request = PlacementRequest {
        storage_pod: pod.reference().clone(),
        resource_pool: hints.resource_pool.clone(),
        host: hints.host.clone(),
        vm_name: hints.vm_name.clone(),
        disk_size_kb,
    };
    match driver.recommend_datastores(&request).await?.into_iter().next() {
        Some(reference) => Ok(Some(driver.datastore(reference).await?)),
        None => Ok(None),
    }
}

async fn first_member(pod: &StoragePod) -> BuildResult<Datastore> {
    pod.members().await?.into_iter().next().ok_or_else(|| {
        BuildError::Validation(format!("datastore cluster '{}' has no datastores", pod.name()))
    })
}

/// Places individual disks given an initial placement.
#[derive(Debug)]
pub struct DiskPlacer<'a> {
    driver: &'a Driver,
    placement: &'a ResolvedPlacement,
    hints: PlacementHints,
}

impl<'a> DiskPlacer<'a> {
    /// Creates a placer for one VM.
    #[must_use]
    pub fn new(driver: &'a Driver, placement: &'a ResolvedPlacement, hints: PlacementHints) -> Self {
        Self {
            driver,
            placement,
            hints,
        }
    }

    /// Returns one datastore per disk, in order.
    ///
    /// Recommendation-based placements with several disks ask the placement
    /// service once per disk. Every other case reuses the resolved datastore
    /// without a remote call.
    pub async fn place(&self, disk_sizes_kb: &[i64]) -> BuildResult<Vec<Datastore>> {
        let Some(pod) = self
            .placement
            .group
            .as_ref()
            .filter(|_| self.placement.needs_per_disk_placement(disk_sizes_kb.len()))
        else {
            return Ok(vec![self.placement.datastore.clone(); disk_sizes_kb.len()]);
        };

        let mut placed = Vec::with_capacity(disk_sizes_kb.len());
        for (index, size) in disk_sizes_kb.iter().enumerate() {
            let datastore = recommend(self.driver, pod, &self.hints, Some(*size))
                .await?
                .unwrap_or_else(|| self.placement.datastore.clone());
            debug!(disk = index, datastore = datastore.name(), "disk placed");
            placed.push(datastore);
        }
        Ok(placed)
    }
}
