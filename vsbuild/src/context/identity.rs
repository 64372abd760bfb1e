//! Run identity for correlating logs and events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifies one build run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Unique id of this run.
    pub run_id: Uuid,

    /// Build name (normally the VM name).
    pub build_name: String,

    /// Caller-supplied correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl RunIdentity {
    /// Creates an identity with a fresh run id.
    #[must_use]
    pub fn new(build_name: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            build_name: build_name.into(),
            request_id: None,
        }
    }

    /// Sets the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Converts to a dictionary with string values (or null).
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
        map.insert("build_name".to_string(), serde_json::json!(self.build_name));
        map.insert(
            "request_id".to_string(),
            self.request_id
                .map_or(serde_json::Value::Null, |id| serde_json::json!(id.to_string())),
        );
        map
    }
}
