//! The `error` module defines the error taxonomy shared by every layer of
//! `propel`.
//!
//! Each error carries a [`Code`] so the transport boundary can translate it
//! into a wire status without inspecting the message text.

use std::fmt;

/// Classification of a [`PushError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// A required field was missing or empty.
    InvalidArgument,
    /// The operation is not allowed in the current configuration.
    FailedPrecondition,
    /// A registry or store lookup missed.
    NotFound,
    /// Backend, transport or (de)serialization failure.
    Internal,
}

impl Code {
    /// Name used on the wire, e.g. in `ResponseStatus::error_code`.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::NotFound => "NOT_FOUND",
            Code::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PushError {
    code: Code,
    message: String,
}

pub type Result<T> = std::result::Result<T, PushError>;

impl PushError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for PushError {
    fn from(err: serde_json::Error) -> Self {
        PushError::internal(format!("serialization error: {err}"))
    }
}

impl From<redis::RedisError> for PushError {
    fn from(err: redis::RedisError) -> Self {
        PushError::internal(format!("redis error: {err}"))
    }
}

impl From<sled::Error> for PushError {
    fn from(err: sled::Error) -> Self {
        PushError::internal(format!("sled error: {err}"))
    }
}
