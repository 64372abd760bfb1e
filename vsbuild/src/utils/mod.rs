//! Small shared helpers: duration strings, datastore paths, address
//! prefixes and timestamps.

mod cidr;
pub mod duration;
mod paths;
pub mod timestamps;

pub use cidr::Cidr;
pub use duration::{format_duration, parse_duration, DurationParseError};
pub use paths::DatastorePath;
pub use timestamps::iso_timestamp;
