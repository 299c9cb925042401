//! Error types for the CSI plugin
//!
//! Provides structured error types for the controller and node services,
//! the cloud client boundary and the host-level device helpers, together
//! with the mapping onto CSI status codes.

use std::time::Duration;
use thiserror::Error;

use crate::csi::StatusCode;

/// Unified error type for the plugin
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Validation Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid volume handle: {handle}: {reason}")]
    InvalidVolumeHandle { handle: String, reason: String },

    #[error("Unsupported volume capability: {0}")]
    UnsupportedCapability(String),

    #[error("Requested capacity out of range: {requested} bytes (supported {min}..={max})")]
    CapacityOutOfRange { requested: i64, min: i64, max: i64 },

    // =========================================================================
    // Cloud Errors
    // =========================================================================
    /// A cloud service call failed; carries the already-classified error.
    #[error("Cloud service error: {0}")]
    Cloud(#[from] crate::cloud::ServiceError),

    #[error("Resource not found: {kind}/{id}")]
    ResourceNotFound { kind: String, id: String },

    #[error("Snapshot {name} already exists with a different source volume")]
    SnapshotSourceMismatch { name: String },

    #[error("Duplicate {kind} with display name {name} in compartment")]
    DuplicateDisplayName { kind: String, name: String },

    #[error("Volume {volume_id} is already attached to another node")]
    AttachedToAnotherNode { volume_id: String },

    #[error("{kind} {id} did not reach {target} (lifecycle state {state})")]
    UnexpectedLifecycleState {
        kind: String,
        id: String,
        target: String,
        state: String,
    },

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    #[error("An operation for the volume: {0} already exists")]
    OperationAlreadyExists(String),

    #[error("Deadline exceeded while waiting for {0}")]
    DeadlineExceeded(String),

    // =========================================================================
    // Node / Host Errors
    // =========================================================================
    #[error("Precondition failed: {0}")]
    FailedPrecondition(String),

    #[error("Device path {path} did not appear")]
    DevicePathNotFound { path: String },

    #[error("Mount operation failed: {0}")]
    Mount(String),

    #[error("Command {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Operation not supported: {0}")]
    Unimplemented(String),
}

/// Action to take on error inside a polling or retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RequeueWithBackoff,
    /// Retry after a specific duration
    RequeueAfter(Duration),
    /// Terminal, surface to the orchestrator
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Cloud(service_err) if service_err.is_retryable() => {
                ErrorAction::RequeueWithBackoff
            }
            Error::Kube(_) => ErrorAction::RequeueWithBackoff,

            // Another operation holds the volume lock; the orchestrator retries
            Error::OperationAlreadyExists(_) => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            Error::DevicePathNotFound { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            _ => ErrorAction::NoRequeue,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// CSI status code surfaced to the orchestrator
    pub fn code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_)
            | Error::InvalidVolumeHandle { .. }
            | Error::UnsupportedCapability(_)
            | Error::CapacityOutOfRange { .. }
            | Error::Configuration(_) => StatusCode::InvalidArgument,

            Error::ResourceNotFound { .. } => StatusCode::NotFound,
            Error::SnapshotSourceMismatch { .. } => StatusCode::AlreadyExists,
            Error::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Error::OperationAlreadyExists(_) => StatusCode::Aborted,
            Error::DeadlineExceeded(_) => StatusCode::DeadlineExceeded,
            Error::Unimplemented(_) => StatusCode::Unimplemented,

            Error::Cloud(service_err) => match service_err.class() {
                crate::cloud::ErrorClass::LimitExceeded => StatusCode::ResourceExhausted,
                crate::cloud::ErrorClass::Client4xx if service_err.is_not_found() => {
                    StatusCode::NotFound
                }
                crate::cloud::ErrorClass::Client4xx => StatusCode::InvalidArgument,
                _ => StatusCode::Internal,
            },

            _ => StatusCode::Internal,
        }
    }
}

/// Result type alias for the plugin
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ErrorClass, ServiceError};

    #[test]
    fn test_error_actions() {
        let err = Error::OperationAlreadyExists("vol-1".into());
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(10))
        );

        let err = Error::InvalidArgument("bad request".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Cloud(ServiceError::http(429, "TooManyRequests", "slow down"));
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::OperationAlreadyExists("v".into()).code(),
            StatusCode::Aborted
        );
        assert_eq!(
            Error::SnapshotSourceMismatch { name: "s".into() }.code(),
            StatusCode::AlreadyExists
        );
        assert_eq!(
            Error::Cloud(ServiceError::limit_exceeded("too many volumes")).code(),
            StatusCode::ResourceExhausted
        );
        assert_eq!(
            Error::Cloud(ServiceError::http(404, "NotFound", "no such volume")).code(),
            StatusCode::NotFound
        );
        assert_eq!(
            Error::Cloud(ServiceError::http(500, "InternalServerError", "boom")).code(),
            StatusCode::Internal
        );
    }

    #[test]
    fn test_lock_error_message() {
        let err = Error::OperationAlreadyExists("ocid1.volume.oc1..x".into());
        assert_eq!(
            err.to_string(),
            "An operation for the volume: ocid1.volume.oc1..x already exists"
        );
    }

    #[test]
    fn test_retryable_classes() {
        assert!(Error::Cloud(ServiceError::http(503, "ServiceUnavailable", "x")).is_retryable());
        assert!(!Error::Cloud(ServiceError::http(400, "InvalidParameter", "x")).is_retryable());
        assert_eq!(
            ServiceError::http(400, "InvalidParameter", "x").class(),
            ErrorClass::Client4xx
        );
    }
}
