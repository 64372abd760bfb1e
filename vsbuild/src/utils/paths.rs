//! Datastore paths in `[datastore] dir/file` form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A file location on a datastore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatastorePath {
    /// Datastore name.
    pub datastore: String,
    /// Path relative to the datastore root, without a leading slash.
    pub path: String,
}

impl DatastorePath {
    /// Creates a path; leading slashes on `path` are dropped.
    #[must_use]
    pub fn new(datastore: impl Into<String>, path: impl AsRef<str>) -> Self {
        Self {
            datastore: datastore.into(),
            path: path.as_ref().trim_start_matches('/').to_string(),
        }
    }

    /// The directory part, empty for files in the datastore root.
    #[must_use]
    pub fn dir(&self) -> &str {
        self.path.rsplit_once('/').map_or("", |(dir, _)| dir)
    }

    /// The final path component.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit_once('/').map_or(self.path.as_str(), |(_, file)| file)
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}

impl FromStr for DatastorePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix('[')
            .ok_or_else(|| format!("'{s}' is not a datastore path"))?;
        let (datastore, path) = rest
            .split_once(']')
            .ok_or_else(|| format!("'{s}' is missing the closing ']'"))?;
        Ok(Self::new(datastore, path.trim()))
    }
}
