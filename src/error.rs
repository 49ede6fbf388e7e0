//! Error taxonomy for the runtime.
//!
//! Every failure that reaches the host is reduced to an [`InvocationError`]
//! carrying a stable [`ErrorCode`]. Only [`RuntimeError::Write`] is fatal to
//! the process; everything else stays inside its own session.

use serde::{Deserialize, Serialize};

/// Stable, machine-readable error codes sent to the host in session `error`
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    CapabilityNotFound,
    Unsupported,
    HandlerError,
    HandlerPanic,
    TaskFailed,
    WorkerCrashed,
    CapacityExceeded,
    BlobIncomplete,
    Timeout,
    Cancelled,
    ShuttingDown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::CapabilityNotFound => "capability_not_found",
            Self::Unsupported => "unsupported",
            Self::HandlerError => "handler_error",
            Self::HandlerPanic => "handler_panic",
            Self::TaskFailed => "task_failed",
            Self::WorkerCrashed => "worker_crashed",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::BlobIncomplete => "blob_incomplete",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by capability implementations (tools, models, endpoints...).
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{0}")]
    Failed(String),
    #[error("action not supported: {0}")]
    Unsupported(&'static str),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("invocation cancelled")]
    Cancelled,
}

impl CapabilityError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Failed(_) => ErrorCode::HandlerError,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::InvalidParameters(_) => ErrorCode::InvalidRequest,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// A failed invocation as reported to the host: stable code plus human text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct InvocationError {
    pub code: ErrorCode,
    pub message: String,
}

impl InvocationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::CapabilityNotFound, format!("{} not found", what))
    }
}

impl From<CapabilityError> for InvocationError {
    fn from(e: CapabilityError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<crate::blob::BlobError> for InvocationError {
    fn from(e: crate::blob::BlobError) -> Self {
        Self::new(ErrorCode::BlobIncomplete, e.to_string())
    }
}

impl From<crate::worker::PoolError> for InvocationError {
    fn from(e: crate::worker::PoolError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<crate::request::RequestError> for InvocationError {
    fn from(e: crate::request::RequestError) -> Self {
        Self::new(ErrorCode::InvalidRequest, e.to_string())
    }
}

/// Process-level errors of the runtime loop.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to write frame: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("capability scan failed: {0}")]
    Scan(#[from] crate::capability::ScanError),
}
