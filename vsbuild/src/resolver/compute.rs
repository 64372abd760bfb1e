//! Compute and folder placement.

use crate::driver::{Cluster, Driver, Folder, Host, ResourcePool};
use crate::errors::{BuildError, BuildResult};

/// Where a VM runs.
#[derive(Debug, Clone)]
pub struct ComputePlacement {
    /// Destination folder.
    pub folder: Folder,
    /// Destination resource pool.
    pub resource_pool: ResourcePool,
    /// Cluster, when named.
    pub cluster: Option<Cluster>,
    /// Pinned host, when named.
    pub host: Option<Host>,
}

/// Resolves folder, cluster, host and resource pool.
///
/// An explicit resource pool path wins; otherwise the root pool of the
/// cluster, then of the host, is used.
pub async fn resolve_compute(
    driver: &Driver,
    folder: &str,
    cluster: Option<&str>,
    host: Option<&str>,
    resource_pool: Option<&str>,
) -> BuildResult<ComputePlacement> {
    let folder = driver.find_folder(folder).await?;
    let cluster = match cluster.filter(|c| !c.is_empty()) {
        Some(name) => Some(driver.find_cluster(name).await?),
        None => None,
    };
    let host = match host.filter(|h| !h.is_empty()) {
        Some(name) => Some(driver.find_host(name).await?),
        None => None,
    };

    let resource_pool = match (resource_pool.filter(|p| !p.is_empty()), &cluster, &host) {
        (Some(path), _, _) => driver.find_resource_pool(path).await?,
        (None, Some(cluster), _) => cluster.resource_pool().await?,
        (None, None, Some(host)) => host.resource_pool().await?,
        (None, None, None) => {
            return Err(BuildError::Validation(
                "either a cluster, a host or a resource pool is required".into(),
            ))
        }
    };

    Ok(ComputePlacement {
        folder,
        resource_pool,
        cluster,
        host,
    })
}
