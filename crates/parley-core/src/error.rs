//! Error taxonomy shared by every parley crate.
//!
//! Every failure that crosses a public boundary is a [`ParleyError`]: a stable
//! machine-readable [`ErrorKind`], a human message, and optional JSON data
//! (the list of envelope violations, the failing chunk of a publish, ...).

use serde::Serialize;
use serde_json::Value;
use std::fmt;

pub type Result<T, E = ParleyError> = std::result::Result<T, E>;

/// Stable error codes. Serialized as the SCREAMING_SNAKE_CASE code returned
/// by [`ErrorKind::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "&'static str")]
pub enum ErrorKind {
    InvalidChunkSize,
    InvalidMaxBytesPerRequest,
    InvalidEnvelope,
    CorrelationMismatch,
    IncompleteChunkSet,
    AlreadySent,
    NotReady,
    AlreadyCreated,
    InvalidOperation,
    ResponseAlreadySent,
    ResponseTooLarge,
    NoTransport,
    RelayConnectionError,
    PublishFailed,
    TimedOut,
    Aborted,
    UnexpectedError,
}

/// Coarse grouping of [`ErrorKind`]s, useful for deciding who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Protocol,
    Lifecycle,
    Transport,
    Temporal,
    Unexpected,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 17] = [
        ErrorKind::InvalidChunkSize,
        ErrorKind::InvalidMaxBytesPerRequest,
        ErrorKind::InvalidEnvelope,
        ErrorKind::CorrelationMismatch,
        ErrorKind::IncompleteChunkSet,
        ErrorKind::AlreadySent,
        ErrorKind::NotReady,
        ErrorKind::AlreadyCreated,
        ErrorKind::InvalidOperation,
        ErrorKind::ResponseAlreadySent,
        ErrorKind::ResponseTooLarge,
        ErrorKind::NoTransport,
        ErrorKind::RelayConnectionError,
        ErrorKind::PublishFailed,
        ErrorKind::TimedOut,
        ErrorKind::Aborted,
        ErrorKind::UnexpectedError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidChunkSize => "INVALID_CHUNK_SIZE",
            ErrorKind::InvalidMaxBytesPerRequest => "INVALID_MAX_BYTES_PER_REQUEST",
            ErrorKind::InvalidEnvelope => "INVALID_ENVELOPE",
            ErrorKind::CorrelationMismatch => "CORRELATION_MISMATCH",
            ErrorKind::IncompleteChunkSet => "INCOMPLETE_CHUNK_SET",
            ErrorKind::AlreadySent => "ALREADY_SENT",
            ErrorKind::NotReady => "NOT_READY",
            ErrorKind::AlreadyCreated => "ALREADY_CREATED",
            ErrorKind::InvalidOperation => "INVALID_OPERATION",
            ErrorKind::ResponseAlreadySent => "RESPONSE_ALREADY_SENT",
            ErrorKind::ResponseTooLarge => "RESPONSE_TOO_LARGE",
            ErrorKind::NoTransport => "NO_TRANSPORT",
            ErrorKind::RelayConnectionError => "RELAY_CONNECTION_ERROR",
            ErrorKind::PublishFailed => "PUBLISH_FAILED",
            ErrorKind::TimedOut => "TIMED_OUT",
            ErrorKind::Aborted => "ABORTED",
            ErrorKind::UnexpectedError => "UNEXPECTED_ERROR",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::InvalidChunkSize | ErrorKind::InvalidMaxBytesPerRequest => {
                ErrorCategory::Configuration
            }
            ErrorKind::InvalidEnvelope
            | ErrorKind::CorrelationMismatch
            | ErrorKind::IncompleteChunkSet => ErrorCategory::Protocol,
            ErrorKind::AlreadySent
            | ErrorKind::NotReady
            | ErrorKind::AlreadyCreated
            | ErrorKind::InvalidOperation
            | ErrorKind::ResponseAlreadySent
            | ErrorKind::ResponseTooLarge => ErrorCategory::Lifecycle,
            ErrorKind::NoTransport
            | ErrorKind::RelayConnectionError
            | ErrorKind::PublishFailed => ErrorCategory::Transport,
            ErrorKind::TimedOut | ErrorKind::Aborted => ErrorCategory::Temporal,
            ErrorKind::UnexpectedError => ErrorCategory::Unexpected,
        }
    }
}

impl From<ErrorKind> for &'static str {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str()
    }
}

/// Unrecognised error code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error kind: {0}")]
pub struct UnknownErrorKind(pub String);

impl TryFrom<&str> for ErrorKind {
    type Error = UnknownErrorKind;

    fn try_from(code: &str) -> std::result::Result<Self, Self::Error> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == code)
            .ok_or_else(|| UnknownErrorKind(code.to_string()))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ParleyError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ParleyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnexpectedError, message)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(e: serde_json::Error) -> Self {
        ParleyError::unexpected(format!("json: {e}"))
    }
}
