//! Run-scoped context.
//!
//! - [`StateBag`]: typed state published between steps
//! - [`RunContext`]: identity, cancellation, events and the publish-watch flag

mod identity;
mod run;
mod state;
mod watch;

pub use identity::RunIdentity;
pub use run::RunContext;
pub use state::StateBag;
pub use watch::{PublishWatch, PublishWatchGuard};
