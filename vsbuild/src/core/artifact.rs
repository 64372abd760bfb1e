//! The immutable result of a successful build.

use crate::driver::ManagedObjectRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

/// Identifier of artifacts produced by this crate.
pub const BUILDER_ID: &str = "vsbuild.vsphere";

/// Where the built VM lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Datacenter name.
    pub datacenter: Option<String>,
    /// VM folder path.
    pub folder: String,
    /// Cluster name.
    pub cluster: Option<String>,
    /// Host name.
    pub host: Option<String>,
    /// Resource pool path.
    pub resource_pool: Option<String>,
    /// Datastore name.
    pub datastore: Option<String>,
}

/// A content library item the VM was captured into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryDestination {
    /// Library name.
    pub library: String,
    /// Item name.
    pub item: String,
    /// Item id.
    pub item_id: String,
}

impl fmt::Display for LibraryDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.library, self.item)
    }
}

/// The record handed to downstream tooling after a successful build.
///
/// Built once with the `with_*` methods, then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    id: String,
    name: String,
    builder_id: String,
    location: Location,
    vm: ManagedObjectRef,
    template: bool,
    content_library: Option<LibraryDestination>,
    labels: BTreeMap<String, String>,
    files: Vec<PathBuf>,
    created_at: String,
}

impl Artifact {
    /// Creates an artifact for the VM `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, vm: ManagedObjectRef, location: Location) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            builder_id: BUILDER_ID.to_string(),
            location,
            vm,
            template: false,
            content_library: None,
            labels: BTreeMap::new(),
            files: Vec::new(),
            created_at: crate::utils::iso_timestamp(),
        }
    }

    /// Marks the artifact as a template.
    #[must_use]
    pub fn with_template(mut self, template: bool) -> Self {
        self.template = template;
        self
    }

    /// Records the content library destination.
    #[must_use]
    pub fn with_content_library(mut self, destination: LibraryDestination) -> Self {
        self.content_library = Some(destination);
        self
    }

    /// Sets the label map.
    #[must_use]
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Sets the generated file list.
    #[must_use]
    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    /// Artifact id (the VM name).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The producing builder.
    #[must_use]
    pub fn builder_id(&self) -> &str {
        &self.builder_id
    }

    /// Location descriptor.
    #[must_use]
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// The VM reference.
    #[must_use]
    pub fn vm(&self) -> &ManagedObjectRef {
        &self.vm
    }

    /// True if the VM was converted to a template.
    #[must_use]
    pub fn is_template(&self) -> bool {
        self.template
    }

    /// The content library destination, if the VM was imported.
    #[must_use]
    pub fn content_library(&self) -> Option<&LibraryDestination> {
        self.content_library.as_ref()
    }

    /// Label map.
    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Generated local files.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Creation time (ISO 8601).
    #[must_use]
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), serde_json::json!(self.id));
        map.insert("name".to_string(), serde_json::json!(self.name));
        map.insert("builder_id".to_string(), serde_json::json!(self.builder_id));
        map.insert("vm".to_string(), serde_json::json!(self.vm.id));
        map.insert("template".to_string(), serde_json::json!(self.template));
        map.insert("labels".to_string(), serde_json::json!(self.labels));
        map.insert("files".to_string(), serde_json::json!(self.files));
        map.insert("created_at".to_string(), serde_json::json!(self.created_at));
        if let Some(ref dest) = self.content_library {
            map.insert(
                "content_library".to_string(),
                serde_json::json!(dest.to_string()),
            );
        }
        map
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.template { "template" } else { "VM" };
        write!(f, "{kind} {}", self.name)?;
        if let Some(ref dest) = self.content_library {
            write!(f, " (content library {dest})")?;
        }
        Ok(())
    }
}
