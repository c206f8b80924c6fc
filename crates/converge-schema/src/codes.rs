use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable outcome codes reported to the scheduler for terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerErrorCode {
    NotFound,
    AlreadyExists,
    ResourceConflict,
    ServiceLimitExceeded,
    InvalidRequest,
    AccessDenied,
    Throttling,
    ServiceInternalError,
    InternalError,
    NotUpdatable,
    NotStabilized,
}

impl HandlerErrorCode {
    pub const ALL: [HandlerErrorCode; 11] = [
        HandlerErrorCode::NotFound,
        HandlerErrorCode::AlreadyExists,
        HandlerErrorCode::ResourceConflict,
        HandlerErrorCode::ServiceLimitExceeded,
        HandlerErrorCode::InvalidRequest,
        HandlerErrorCode::AccessDenied,
        HandlerErrorCode::Throttling,
        HandlerErrorCode::ServiceInternalError,
        HandlerErrorCode::InternalError,
        HandlerErrorCode::NotUpdatable,
        HandlerErrorCode::NotStabilized,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HandlerErrorCode::NotFound => "NotFound",
            HandlerErrorCode::AlreadyExists => "AlreadyExists",
            HandlerErrorCode::ResourceConflict => "ResourceConflict",
            HandlerErrorCode::ServiceLimitExceeded => "ServiceLimitExceeded",
            HandlerErrorCode::InvalidRequest => "InvalidRequest",
            HandlerErrorCode::AccessDenied => "AccessDenied",
            HandlerErrorCode::Throttling => "Throttling",
            HandlerErrorCode::ServiceInternalError => "ServiceInternalError",
            HandlerErrorCode::InternalError => "InternalError",
            HandlerErrorCode::NotUpdatable => "NotUpdatable",
            HandlerErrorCode::NotStabilized => "NotStabilized",
        }
    }
}

impl fmt::Display for HandlerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad class of a fault, independent of any service-specific error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    /// The service answered with an error payload.
    Service,
    /// No service response was obtained (transport failure, timeout, undecodable reply).
    Client,
    /// Credentials were rejected before the request reached the service.
    AccessDenied,
    /// The request was rejected locally before being sent.
    Validation,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Service => write!(f, "service"),
            FaultKind::Client => write!(f, "client"),
            FaultKind::AccessDenied => write!(f, "access-denied"),
            FaultKind::Validation => write!(f, "validation"),
        }
    }
}

/// Verdict for a classified fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorStatus {
    /// Treat the fault as having had no effect and keep going.
    Ignore,
    /// Terminate the operation with the given code.
    FailWith(HandlerErrorCode),
}

impl ErrorStatus {
    pub fn ignore() -> Self {
        ErrorStatus::Ignore
    }

    pub fn fail_with(code: HandlerErrorCode) -> Self {
        ErrorStatus::FailWith(code)
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::Ignore => write!(f, "ignore"),
            ErrorStatus::FailWith(code) => write!(f, "fail-with({code})"),
        }
    }
}
