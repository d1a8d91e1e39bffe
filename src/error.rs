//! Closed error taxonomy shared by every surface (HTTP, MQTT, KNX, internal).
//!
//! Each adapter maps `ErrorKind` onto its own wire representation; the enum
//! here is the one thing all of them agree on, so adding a new kind forces a
//! compile error at every `match` site instead of a silently-missing case.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidOperation,
    UpstreamUnavailable,
    UpstreamTimeout,
    Config,
    AdapterLag,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidOperation => "INVALID_OPERATION",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ErrorKind::Config => "CONFIG",
            ErrorKind::AdapterLag => "ADAPTER_LAG",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Default HTTP status for this kind, used by the REST surface (§6).
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidOperation => 409,
            ErrorKind::UpstreamUnavailable => 503,
            ErrorKind::UpstreamTimeout => 504,
            ErrorKind::Config => 500,
            ErrorKind::AdapterLag => 503,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct SnapDogError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SnapDogError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation, message)
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTimeout, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

pub type Result<T> = std::result::Result<T, SnapDogError>;
