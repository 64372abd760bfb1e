//! Network lookup with host-based disambiguation.

use crate::driver::{Driver, Host, Network};
use crate::errors::{BuildError, BuildResult};
use tracing::debug;

/// Resolves a network by name.
///
/// Several networks may share a name (for example a standard port group on
/// each host). Those are narrowed down to the ones visible on `host`; if that
/// still leaves more than one, or no host is known, the lookup fails.
pub async fn resolve_network(driver: &Driver, name: &str, host: Option<&Host>) -> BuildResult<Network> {
    let mut candidates = driver.find_networks(name).await?;
    match candidates.len() {
        0 => return Err(BuildError::not_found("network", name)),
        1 => return Ok(candidates.remove(0)),
        _ => {}
    }

    let total = candidates.len();
    let Some(host) = host else {
        return Err(BuildError::ambiguous("network", name, total));
    };

    let visible = host.networks().await?;
    candidates.retain(|n| visible.contains(n.reference()));
    debug!(network = name, host = host.name(), total, visible = candidates.len(), "disambiguating network by host");

    if candidates.len() == 1 {
        Ok(candidates.remove(0))
    } else {
        Err(BuildError::ambiguous("network", name, total))
    }
}
