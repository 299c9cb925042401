//! Cloud service error classification
//!
//! Every error crossing the cloud-client boundary is normalized into a
//! [`ServiceError`] carrying the HTTP status, the service error code and the
//! message. Classification into retryable/terminal classes happens here,
//! once, so the await loops and the RPC handlers agree on the policy.

use serde::{Deserialize, Serialize};

/// Service error code paired with the HTTP status that makes it retryable.
const RETRYABLE_CODES: &[(u16, &str)] = &[
    (400, "RelatedResourceNotAuthorizedOrNotFound"),
    (401, "NotAuthenticated"),
    (404, "NotAuthorizedOrNotFound"),
    (409, "IncorrectState"),
    (409, "NotAuthorizedOrResourceAlreadyExists"),
    (429, "TooManyRequests"),
    (500, "InternalServerError"),
];

/// Reserved defined-tag namespace injected for resource attribution.
pub const RESOURCE_TRACKING_TAG_NAMESPACE: &str = "orcl-containerengine";

/// Coarse error class used for metric labels and status-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// HTTP 4xx other than 429 and limit-exceeded
    Client4xx,
    /// HTTP 429, rate limited
    RateLimited,
    /// HTTP 5xx
    Server5xx,
    /// Service limit exceeded
    LimitExceeded,
    /// Local validation failure, no HTTP exchange happened
    Validation,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Client4xx => write!(f, "4XX"),
            ErrorClass::RateLimited => write!(f, "429"),
            ErrorClass::Server5xx => write!(f, "5XX"),
            ErrorClass::LimitExceeded => write!(f, "LimitExceeded"),
            ErrorClass::Validation => write!(f, "Validation"),
        }
    }
}

/// A failure reported by the cloud control plane.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code} (status {status}): {message}")]
pub struct ServiceError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl ServiceError {
    pub fn http(status: u16, code: &str, message: &str) -> Self {
        ServiceError {
            status,
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// A local validation failure, surfaced in the same shape.
    pub fn validation(message: &str) -> Self {
        ServiceError {
            status: 0,
            code: "ValidationError".to_string(),
            message: message.to_string(),
        }
    }

    pub fn limit_exceeded(message: &str) -> Self {
        ServiceError {
            status: 400,
            code: "LimitExceeded".to_string(),
            message: message.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        if self.status == 0 {
            return ErrorClass::Validation;
        }
        if self.code == "LimitExceeded" {
            return ErrorClass::LimitExceeded;
        }
        match self.status {
            429 => ErrorClass::RateLimited,
            s if (400..500).contains(&s) => ErrorClass::Client4xx,
            _ => ErrorClass::Server5xx,
        }
    }

    /// True if the resource addressed by the call does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Retryable inside await loops: rate limits, server errors, and the
    /// known transient 4xx code/status pairs.
    pub fn is_retryable(&self) -> bool {
        if self.status >= 500 || self.status == 429 {
            return true;
        }
        RETRYABLE_CODES
            .iter()
            .any(|(status, code)| *status == self.status && *code == self.code)
    }

    /// Adding system tags can fail when the reserved tag namespace is not
    /// visible to the caller. The service reports this as a 400 with a
    /// message naming the namespace; callers strip the namespace and retry.
    pub fn is_system_tag_not_found_or_not_authorised(&self) -> bool {
        self.status == 400
            && self.code == "RelatedResourceNotAuthorizedOrNotFound"
            && self.message.contains("tag namespace")
            && self.message.contains(RESOURCE_TRACKING_TAG_NAMESPACE)
    }
}
