//! Error types for the RID manager
//!
//! Provides structured error types for every lifecycle component including
//! the shell executor, device index, provisioner, mount state machine,
//! metadata relocation, sequester ledger, and batch orchestration.

use crate::domain::Rid;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the RID manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Resource {rid} not found: {reason}")]
    ResourceNotFound { rid: Rid, reason: String },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    #[error("Resource {rid} is already {state}")]
    AlreadyInState { rid: Rid, state: String },

    #[error("Destination already exists: {}", .path.display())]
    DestinationExists { path: PathBuf },

    #[error("Resource {rid} is busy: {} open handle(s) under {}", .holders.len(), .path.display())]
    Busy {
        rid: Rid,
        path: PathBuf,
        holders: Vec<String>,
    },

    #[error("Resource {rid} is sequestered: {status}")]
    Sequestered { rid: Rid, status: String },

    #[error("Aborted: {0}")]
    Declined(String),

    // =========================================================================
    // Descriptor / Settings Errors
    // =========================================================================
    #[error("Resource {rid} has no mount descriptor at {}", .path.display())]
    MissingDescriptor { rid: Rid, path: PathBuf },

    #[error("Malformed {what}: {reason}")]
    Malformed { what: String, reason: String },

    #[error("Resource {rid} is in an inconsistent state: {reason}")]
    Inconsistent { rid: Rid, reason: String },

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    #[error("External command `{command}` failed: {reason}")]
    ExternalTool { command: String, reason: String },

    #[error("External command `{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Timed out waiting for lock on resource {rid} ({})", .path.display())]
    LockContention { rid: Rid, path: PathBuf },

    // =========================================================================
    // Partial Failure Errors
    // =========================================================================
    #[error("{operation} of resource {rid} failed: {cause}{}", rollback_suffix(.rollback))]
    PartialFailure {
        rid: Rid,
        operation: &'static str,
        cause: Box<Error>,
        rollback: Vec<String>,
    },

    #[error("Unmount of resource {rid} incomplete: {}", .failures.join("; "))]
    IncompleteUnmount { rid: Rid, failures: Vec<String> },

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn rollback_suffix(rollback: &[String]) -> String {
    if rollback.is_empty() {
        String::new()
    } else {
        format!(" (rollback errors: {})", rollback.join("; "))
    }
}

/// Stable error taxonomy used for branching and CLI exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Usage, validation, or otherwise unclassified failure
    Generic,
    /// Resource is already in the requested state
    AlreadyInState,
    /// Mount descriptor or settings missing or invalid
    Malformed,
    /// A mount/unmount sequence failed part way through
    Partial,
    /// Open files block the operation
    Busy,
    /// Quarantine blocks the operation
    Sequestered,
    /// Unknown RID or device
    NotFound,
    /// An underlying tool exited unsuccessfully
    ExternalToolFailure,
    /// A command or lock wait exceeded its bound
    Timeout,
    /// The operation was cancelled before completion
    Cancelled,
}

impl ErrorKind {
    /// Process exit code for this kind of failure
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Generic => 1,
            ErrorKind::AlreadyInState => 2,
            ErrorKind::Malformed => 3,
            ErrorKind::Partial => 4,
            ErrorKind::Busy => 5,
            ErrorKind::Sequestered => 6,
            ErrorKind::NotFound => 7,
            ErrorKind::ExternalToolFailure => 8,
            ErrorKind::Timeout => 9,
            ErrorKind::Cancelled => 10,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Generic => write!(f, "generic"),
            ErrorKind::AlreadyInState => write!(f, "already_in_state"),
            ErrorKind::Malformed => write!(f, "malformed"),
            ErrorKind::Partial => write!(f, "partial"),
            ErrorKind::Busy => write!(f, "busy"),
            ErrorKind::Sequestered => write!(f, "sequestered"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::ExternalToolFailure => write!(f, "external_tool_failure"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl Error {
    /// Classify this error into the stable taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceNotFound { .. } | Error::DeviceNotFound { .. } => ErrorKind::NotFound,

            Error::AlreadyInState { .. } | Error::DestinationExists { .. } => {
                ErrorKind::AlreadyInState
            }

            Error::Busy { .. } => ErrorKind::Busy,
            Error::Sequestered { .. } => ErrorKind::Sequestered,

            Error::MissingDescriptor { .. }
            | Error::Malformed { .. }
            | Error::Inconsistent { .. } => ErrorKind::Malformed,

            Error::PartialFailure { .. } | Error::IncompleteUnmount { .. } => ErrorKind::Partial,

            Error::ExternalTool { .. } => ErrorKind::ExternalToolFailure,
            Error::Timeout { .. } | Error::LockContention { .. } => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,

            Error::Internal(_)
            | Error::Configuration(_)
            | Error::InvalidArgument(_)
            | Error::Declined(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Metrics(_)
            | Error::Io(_) => ErrorKind::Generic,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::LockContention { .. } | Error::Busy { .. }
        )
    }

    /// Shorthand for an external tool failure
    pub fn external(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ExternalTool {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a malformed on-disk record
    pub fn malformed(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Malformed {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the RID manager
pub type Result<T> = std::result::Result<T, Error>;
