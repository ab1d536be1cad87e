//! WolfStore Error Types

use thiserror::Error;

/// Result type alias for WolfStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes used by schedulers to decide whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network or remote-side failure; another source may succeed
    Transient,
    /// Local disk would run past its capacity limit
    ResourceExhausted,
    /// Data disagrees with an invariant; never retried
    Consistency,
    /// A non-blocking lock was held by someone else
    LockContention,
    /// Tablet, file or snapshot absent when expected
    NotFound,
    /// Local filesystem failure
    Io,
    /// Bad configuration or request
    Config,
}

/// WolfStore error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tablet {0} not found")]
    TabletNotFound(i64),

    #[error("Tablet {0} already exists")]
    AlreadyExists(i64),

    // Concurrency errors
    #[error("Try lock failed: {0}")]
    TryLockFailed(String),

    #[error("Tablet {tablet_id} is in transition: {reason}")]
    TransitionConflict { tablet_id: i64, reason: String },

    // Capacity errors
    #[error("Reach the capacity limit of path {path}, file_size={size}")]
    ExceededLimit { path: String, size: u64 },

    // Consistency errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Remote returned {code}: {message}")]
    RemoteStatus { code: String, message: String },

    /// Never carries the request url, which holds the cluster token
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    // Filesystem errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Meta store errors
    #[error("Meta store error: {0}")]
    MetaStore(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::ConfigParse(_) | Error::InvalidArgument(_) => {
                ErrorCategory::Config
            }
            Error::NotFound(_) | Error::TabletNotFound(_) => ErrorCategory::NotFound,
            Error::TryLockFailed(_) | Error::TransitionConflict { .. } => {
                ErrorCategory::LockContention
            }
            Error::ExceededLimit { .. } => ErrorCategory::ResourceExhausted,
            Error::Internal(_) | Error::AlreadyExists(_) => ErrorCategory::Consistency,
            Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::RemoteStatus { .. }
            | Error::Http(_)
            | Error::ShuttingDown => ErrorCategory::Transient,
            Error::PermissionDenied(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Json(_)
            | Error::MetaStore(_) => ErrorCategory::Io,
        }
    }

    /// Check if this error is retryable by a later scheduling round
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::LockContention
        )
    }

    /// Build an error from an io error, keeping the path that failed
    pub fn from_io(path: &std::path::Path, e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(path.display().to_string())
            }
            _ => Error::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            )),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.without_url())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::MetaStore(format!("SQLite error: {}", e))
    }
}
