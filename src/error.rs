//! Error types for the Hemmer provisioning engine.
//!
//! Each layer has its own error type. Graph and plan errors are fatal for the
//! whole run and are raised before any provider call is made. Driver and state
//! errors are scoped to a single step.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building a resource graph from a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two declarations share an identifier (resources and variables share
    /// one namespace).
    #[error("Duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    /// An identifier contains characters that cannot be used as a state key.
    #[error("Invalid identifier '{0}': only ASCII letters, digits, '_', '-' and '.' are allowed")]
    InvalidIdentifier(String),

    /// A reference or explicit dependency points at nothing in the document.
    #[error("Resource '{id}' references unknown resource '{target}'")]
    UnknownReference {
        /// The resource containing the reference.
        id: String,
        /// The missing target.
        target: String,
    },

    /// No driver is registered for the resource type.
    #[error("Resource '{id}' has unknown type '{resource_type}'")]
    UnknownType {
        /// The resource declaring the type.
        id: String,
        /// The unregistered type tag.
        resource_type: String,
    },

    /// A mapping repeats a key.
    #[error("Resource '{id}' repeats key '{path}'")]
    DuplicateKey {
        /// The resource containing the mapping.
        id: String,
        /// Dotted path of the repeated key.
        path: String,
    },

    /// A literal property value violates the resource schema.
    #[error("Resource '{id}' has invalid property '{attribute}': {detail}")]
    InvalidProperty {
        /// The offending resource.
        id: String,
        /// Dotted attribute path.
        attribute: String,
        /// What is wrong with it.
        detail: String,
    },

    /// The document could not be parsed.
    #[error("Malformed document: {0}")]
    Malformed(String),
}

/// Errors raised while compiling a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The dependency graph contains at least one cycle.
    #[error("Dependency cycle detected between: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    /// A declared resource changed type relative to recorded state.
    #[error("Resource '{id}' changed type from '{from}' to '{to}'; rename it to replace the resource")]
    TypeChanged {
        /// The resource identifier.
        id: String,
        /// Recorded type.
        from: String,
        /// Declared type.
        to: String,
    },
}

/// Whether a driver failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, throttling or timeout failures. Retried with backoff.
    Transient,
    /// Validation, permission or conflict failures. Never retried.
    Permanent,
}

/// Errors reported by a resource driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The requested resource was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The provider rejected the properties.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource already exists (create conflict).
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied (authentication/authorization failure).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Quota or rate limit exceeded.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Service temporarily unavailable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Operation timed out.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Connection-level failure talking to the provider.
    #[error("Network error: {0}")]
    Network(String),

    /// Operation failed due to current state (precondition not met).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation not implemented by this driver.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other provider failure.
    #[error("Provider error: {0}")]
    Provider(String),
}

impl DriverError {
    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg) => msg,
            Self::Validation(msg) => msg,
            Self::AlreadyExists(msg) => msg,
            Self::PermissionDenied(msg) => msg,
            Self::ResourceExhausted(msg) => msg,
            Self::Unavailable(msg) => msg,
            Self::DeadlineExceeded(msg) => msg,
            Self::Network(msg) => msg,
            Self::FailedPrecondition(msg) => msg,
            Self::Unimplemented(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::Provider(msg) => msg,
        }
    }

    /// Classify the error for the retry loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ResourceExhausted(_)
            | Self::Unavailable(_)
            | Self::DeadlineExceeded(_)
            | Self::Network(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// Shorthand for `class() == ErrorClass::Transient`.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Drivers that front a gRPC provider plugin get their failures classified
/// from the status code.
impl From<tonic::Status> for DriverError {
    fn from(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(msg),
            tonic::Code::InvalidArgument | tonic::Code::OutOfRange => Self::Validation(msg),
            tonic::Code::AlreadyExists => Self::AlreadyExists(msg),
            tonic::Code::PermissionDenied | tonic::Code::Unauthenticated => {
                Self::PermissionDenied(msg)
            },
            tonic::Code::ResourceExhausted => Self::ResourceExhausted(msg),
            tonic::Code::Unavailable | tonic::Code::Aborted => Self::Unavailable(msg),
            tonic::Code::DeadlineExceeded => Self::DeadlineExceeded(msg),
            tonic::Code::FailedPrecondition => Self::FailedPrecondition(msg),
            tonic::Code::Unimplemented => Self::Unimplemented(msg),
            _ => Self::Provider(msg),
        }
    }
}

/// Errors from state persistence.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Filesystem failure.
    #[error("State I/O error at {}", path.display())]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A state file could not be encoded or decoded.
    #[error("State serialization error for '{id}'")]
    Serialization {
        /// The resource whose record failed.
        id: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A state file was written by a newer engine.
    #[error("State file version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u32,
        /// Highest version this build understands.
        supported: u32,
    },

    /// The key cannot be used as a file name.
    #[error("Invalid state key: {0}")]
    InvalidKey(String),

    /// Another run holds the state lock.
    #[error("State is locked by {holder} since {since}")]
    Locked {
        /// Host that holds the lock.
        holder: String,
        /// When it was acquired.
        since: String,
    },
}

/// Why a single plan step did not succeed.
#[derive(Debug, Error)]
pub enum StepError {
    /// The driver failed (after retries, for transient errors).
    #[error("driver call failed after {attempts} attempt(s)")]
    Driver {
        /// Number of driver calls made.
        attempts: u32,
        /// The last driver error.
        #[source]
        source: DriverError,
    },

    /// The provider call succeeded but the record could not be written; the
    /// real resource may be ahead of state.
    #[error("failed to record state")]
    State(#[from] StateStoreError),

    /// A reference could not be resolved from dependency outputs.
    #[error("cannot resolve reference: {0}")]
    Resolution(String),

    /// No driver is registered for the step's type.
    #[error("no driver registered for type '{0}'")]
    UnknownType(String),

    /// The driver task panicked.
    #[error("driver task panicked")]
    Panicked,

    /// The run was cancelled while the step was retrying.
    #[error("cancelled")]
    Cancelled,
}

/// Errors from a whole engine run before execution starts.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The document is invalid.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No valid plan exists.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// State could not be loaded or locked.
    #[error(transparent)]
    State(#[from] StateStoreError),
}

/// Render an error followed by its `source()` chain, joined by `": "`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        current = cause.source();
    }
    out
}
