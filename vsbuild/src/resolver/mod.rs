//! Name-to-object resolution.

mod compute;
mod datastore;
mod network;

pub use compute::{resolve_compute, ComputePlacement};
pub use datastore::{
    resolve_datastore, DatastoreTarget, DiskPlacer, PlacementHints, ResolvedPlacement,
    SelectionMethod,
};
pub use network::resolve_network;
