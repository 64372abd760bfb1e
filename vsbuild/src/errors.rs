//! Error types for vsbuild.
//!
//! The taxonomy separates assembly defects (missing state, invalid
//! configuration) from conditions reported by the management plane, and keeps
//! timeouts distinct from cancellation. Polling waits report cancellation
//! through their outcome types; a remote task wait that is interrupted yields
//! `Cancelled`, which steps never record as the run's failure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for build operations.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A step required a state bag entry that an earlier step never published.
    #[error("required state '{key}' is missing; a previous step did not run or the pipeline was mis-assembled")]
    MissingState {
        /// The state bag key.
        key: &'static str,
    },

    /// The build configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The pipeline could not be assembled.
    #[error("{0}")]
    Pipeline(#[from] PipelineValidationError),

    /// The management plane rejected or failed an operation.
    #[error("{0}")]
    Remote(#[from] RemoteError),

    /// A named inventory object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind (datastore, network, ...).
        kind: String,
        /// The name that was looked up.
        name: String,
    },

    /// A name matched several objects and could not be disambiguated.
    #[error("multiple {kind}s found with name '{name}' ({count} matches)")]
    Ambiguous {
        /// Object kind.
        kind: String,
        /// The ambiguous name.
        name: String,
        /// Number of matches.
        count: usize,
    },

    /// A request was rejected before it was submitted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A wait exceeded its wall-clock budget.
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// The configured timeout.
        after: Duration,
    },

    /// The run was cancelled while a remote task was outstanding.
    #[error("cancelled while waiting for {operation}")]
    Cancelled {
        /// The interrupted operation.
        operation: String,
    },

    /// A downloaded file did not match the expected checksum.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    Checksum {
        /// The file that was verified.
        path: PathBuf,
        /// Expected digest (hex).
        expected: String,
        /// Computed digest (hex).
        actual: String,
    },

    /// A source file could not be fetched.
    #[error("download of '{url}' failed: {reason}")]
    Download {
        /// The source location.
        url: String,
        /// Why it failed.
        reason: String,
    },

    /// A user provisioner or guest command failed.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// The first error of a run, tagged with the step that produced it.
    #[error("step '{step}' failed: {source}")]
    Step {
        /// Step name.
        step: String,
        /// Underlying cause.
        #[source]
        source: Box<BuildError>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BuildError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates an ambiguity error.
    #[must_use]
    pub fn ambiguous(kind: impl Into<String>, name: impl Into<String>, count: usize) -> Self {
        Self::Ambiguous {
            kind: kind.into(),
            name: name.into(),
            count,
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Wraps this error with the name of the step that produced it.
    ///
    /// Already-wrapped errors are returned unchanged.
    #[must_use]
    pub fn in_step(self, step: impl Into<String>) -> Self {
        match self {
            Self::Step { .. } => self,
            other => Self::Step {
                step: step.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, skipping step wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true for assembly or configuration defects.
    ///
    /// These indicate a programming error rather than a transient remote
    /// condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Self::MissingState { .. } | Self::Config(_) | Self::Pipeline(_)
        )
    }

    /// Returns true if this error only reports a cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), Self::Cancelled { .. })
    }

    /// Returns true if this is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }

    /// Returns a short machine-readable error type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Self::MissingState { .. } => "MissingState",
            Self::Config(_) => "Config",
            Self::Pipeline(_) => "Pipeline",
            Self::Remote(_) => "Remote",
            Self::NotFound { .. } => "NotFound",
            Self::Ambiguous { .. } => "Ambiguous",
            Self::Validation(_) => "Validation",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled { .. } => "Cancelled",
            Self::Checksum { .. } => "Checksum",
            Self::Download { .. } => "Download",
            Self::Provision(_) => "Provision",
            Self::Io(_) => "Io",
            Self::Serialization(_) => "Serialization",
            Self::Step { .. } => "Step",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("fatal".to_string(), serde_json::json!(self.is_fatal()));
        if let Self::Step { step, .. } = self {
            map.insert("step".to_string(), serde_json::json!(step));
        }
        if let Self::Remote(remote) = self.root() {
            map.insert("fault".to_string(), serde_json::json!(remote.fault));
        }
        map
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Categorised remote fault kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFault {
    /// Login rejected or session expired.
    Authentication,
    /// The caller lacks a privilege.
    AccessDenied,
    /// The referenced object no longer exists.
    NotFound,
    /// The object is in a state that forbids the operation.
    InvalidState,
    /// The request was malformed or carried invalid arguments.
    InvalidArgument,
    /// A submitted task finished in error.
    TaskFailed,
    /// The API could not be reached.
    Connection,
    /// Anything else.
    Other,
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Authentication => "authentication",
            Self::AccessDenied => "access denied",
            Self::NotFound => "not found",
            Self::InvalidState => "invalid state",
            Self::InvalidArgument => "invalid argument",
            Self::TaskFailed => "task failed",
            Self::Connection => "connection",
            Self::Other => "error",
        };
        f.write_str(s)
    }
}

/// An error reported by the management plane, carrying its message verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("remote {fault}: {message}")]
pub struct RemoteError {
    /// Fault category.
    pub fault: RemoteFault,
    /// The remote-supplied message.
    pub message: String,
}

impl RemoteError {
    /// Creates a new remote error.
    #[must_use]
    pub fn new(fault: RemoteFault, message: impl Into<String>) -> Self {
        Self {
            fault,
            message: message.into(),
        }
    }

    /// Creates a task failure.
    #[must_use]
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(RemoteFault::TaskFailed, message)
    }

    /// Creates a not-found fault.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteFault::NotFound, message)
    }

    /// Creates an invalid-state fault.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(RemoteFault::InvalidState, message)
    }

    /// Creates an invalid-argument fault.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RemoteFault::InvalidArgument, message)
    }

    /// Creates an authentication fault.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(RemoteFault::Authentication, message)
    }
}

/// Configuration validation failure listing every problem found.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {}", errors.join("; "))]
pub struct ConfigError {
    /// Individual problems.
    pub errors: Vec<String>,
}

impl ConfigError {
    /// Creates a config error with a single problem.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }

    /// Creates a config error from collected problems.
    #[must_use]
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self { errors }
    }
}

/// Metadata about a pipeline assembly error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PIPELINE-EMPTY").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Error raised when a pipeline cannot be assembled.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The steps involved in the error.
    pub steps: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            steps: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the steps involved.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

/// Convenience alias.
pub type BuildResult<T> = Result<T, BuildError>;
