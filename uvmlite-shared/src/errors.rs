//! Error types for utility VM management.

use thiserror::Error;

/// Result alias used throughout uvmlite.
pub type UvmResult<T> = Result<T, UvmError>;

/// Errors returned by utility VM operations.
#[derive(Debug, Error)]
pub enum UvmError {
    /// Operation invoked outside the lifecycle phase it is legal in.
    #[error("VM is not in {expected} state (current state: {actual})")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// Value outside a recognized enumeration or a platform gate not met.
    #[error("{0}")]
    Unsupported(String),

    /// A required parent element (e.g. a controller) is absent.
    #[error("{0} has not been added")]
    MissingPrerequisite(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A call against the compute system failed.
    #[error("{}", compute_system_message(.op, .id, .resource_path, .source))]
    ComputeSystem {
        op: &'static str,
        id: String,
        resource_path: Option<String>,
        #[source]
        source: Box<UvmError>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("hvsocket error: {0}")]
    HvSocket(String),

    /// Failure reported by a control-surface backend itself.
    #[error("{0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

fn compute_system_message(
    op: &str,
    id: &str,
    resource_path: &Option<String>,
    source: &UvmError,
) -> String {
    match resource_path {
        Some(path) => format!("{op} on compute system '{id}' ({path}) failed: {source}"),
        None => format!("{op} on compute system '{id}' failed: {source}"),
    }
}

impl UvmError {
    /// Wrap a control-surface failure with the call and resource it targeted.
    pub fn compute_system(
        op: &'static str,
        id: impl Into<String>,
        resource_path: Option<String>,
        source: UvmError,
    ) -> Self {
        UvmError::ComputeSystem {
            op,
            id: id.into(),
            resource_path,
            source: Box::new(source),
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, UvmError::InvalidState { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, UvmError::Cancelled(_) | UvmError::DeadlineExceeded(_))
    }
}
