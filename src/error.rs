//! Error types for the port allocation and proxy reconciliation subsystem

use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced by the allocator, reconciler, and coordinator
#[derive(Debug, Error)]
pub enum Error {
    /// No free port remained after a full cursor wrap of the named range
    #[error("port range '{range}' exhausted")]
    PortRangeExhausted {
        /// Name of the range that ran out
        range: String,
    },

    /// The durable uniqueness constraint rejected a port the in-process
    /// allocator considered free (another coordinator instance won the race)
    #[error("port {port} is already assigned in the datastore")]
    PortConflict {
        /// The colliding port number
        port: u16,
    },

    /// The app already holds a live port assignment
    #[error("app '{0}' already has a port assignment")]
    DuplicateAssignment(String),

    /// The rendered configuration failed the structural or external check;
    /// the live proxy was not touched
    #[error("proxy config validation failed: {0}")]
    ConfigValidation(String),

    /// The reload signal errored or timed out; the previous configuration
    /// was restored and remains live
    #[error("proxy reload failed: {0}")]
    ReloadFailed(String),

    /// A deploy failed after ports were reserved; ports and route have been
    /// rolled back before this error was returned
    #[error("deployment of '{app_id}' failed: {source}")]
    DeploymentFailed {
        /// The app whose deploy was rolled back
        app_id: String,
        /// The downstream failure that triggered the rollback
        #[source]
        source: Box<Error>,
    },

    /// Database error from the persistence layer
    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    /// Filesystem error while staging or activating configuration
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller can safely retry the failed operation as-is.
    ///
    /// Teardown retries are always safe (release is idempotent, apply is
    /// idempotent for an unchanged route set); a failed deploy must be
    /// re-issued as a fresh deploy instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ReloadFailed(_) | Error::PortConflict { .. })
    }

    /// Stable machine-readable code for the X-Portgate-Error header
    pub fn code(&self) -> &'static str {
        match self {
            Error::PortRangeExhausted { .. } => "PORT_RANGE_EXHAUSTED",
            Error::PortConflict { .. } => "PORT_CONFLICT",
            Error::DuplicateAssignment(_) => "DUPLICATE_ASSIGNMENT",
            Error::ConfigValidation(_) => "CONFIG_VALIDATION_ERROR",
            Error::ReloadFailed(_) => "RELOAD_FAILED",
            Error::DeploymentFailed { .. } => "DEPLOYMENT_FAILED",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status the admin API reports for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::PortRangeExhausted { .. } => StatusCode::CONFLICT,
            Error::PortConflict { .. } => StatusCode::CONFLICT,
            Error::DuplicateAssignment(_) => StatusCode::CONFLICT,
            Error::ConfigValidation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ReloadFailed(_) => StatusCode::BAD_GATEWAY,
            Error::DeploymentFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
