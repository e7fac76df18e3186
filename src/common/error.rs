//! Error types for joinrelay

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure classes used to decide whether a run can continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A local prerequisite did not converge (runtime, module, sysctl)
    Precondition,
    /// An external action (init, join) failed and must not be re-run blindly
    ExternalCall,
    /// A bounded retry loop ran out of attempts
    Timeout,
    /// A best-effort observation failed; the caller keeps going
    Observation,
    /// Local state is fine, only propagation to the shared store failed
    Propagation,
    /// Anything else (config, I/O, store server errors)
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Bootstrap Errors ===
    #[error("Precondition not met: {0}")]
    Precondition(String),

    #[error("Command `{program}` failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Control plane initialization failed: {0}")]
    ControlPlaneInit(String),

    #[error("Metadata service error: {0}")]
    Metadata(String),

    // === Credential Errors ===
    #[error("Invalid join credential: {0}")]
    InvalidCredential(String),

    #[error("Join credential already published under {0}")]
    AlreadyPublished(String),

    #[error("Failed to propagate join credential to {key}: {reason}")]
    Propagation { key: String, reason: String },

    // === Join Errors ===
    #[error("Join failed with credential `{credential}`: {reason}")]
    JoinFailed { credential: String, reason: String },

    #[error("Membership verification failed: {0}")]
    Membership(String),

    #[error("Observation failed: {0}")]
    Observation(String),

    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    // === Channel / Store Errors ===
    #[error("Coordination channel error: {0}")]
    Channel(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Bootstrap marker error: {0}")]
    Marker(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Which failure class this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Precondition(_) => ErrorKind::Precondition,
            Error::ControlPlaneInit(_)
            | Error::JoinFailed { .. }
            | Error::CommandFailed { .. }
            | Error::Metadata(_)
            | Error::InvalidCredential(_)
            | Error::AlreadyPublished(_)
            | Error::Membership(_) => ErrorKind::ExternalCall,
            Error::RetriesExhausted { .. } => ErrorKind::Timeout,
            Error::Propagation { .. } => ErrorKind::Propagation,
            Error::Observation(_) => ErrorKind::Observation,
            _ => ErrorKind::Other,
        }
    }

    /// Should the owning process stop and exit non-zero?
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Observation)
    }

    /// Is a single attempt failing with this error worth retrying inside a poll loop?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Channel(_)
                | Error::Http(_)
                | Error::NotFound(_)
                | Error::CommandFailed { .. }
                | Error::InvalidCredential(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", e))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
