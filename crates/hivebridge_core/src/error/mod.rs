//! Caller-facing error taxonomy and backing failure shapes.
//!
//! # Responsibility
//! - Define the closed set of structured error codes replied to callers.
//! - Define the single failure shape every backing collaborator returns.
//!
//! # Invariants
//! - Wire values of `ErrorCode` are stable and grouped by range
//!   (vault, database, files, bridge).
//! - A `StructuredError` is built fresh per failure and never persisted.

mod normalizer;

pub use normalizer::{normalize, VAULT_NOT_FOUND_MESSAGE};

use serde::Serialize;
use serde_json::{json, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Closed taxonomy of caller-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Vault errors: -1 ~ -999
    VaultNotFound,
    ProviderNotPublished,
    DidNotPublished,
    // Database errors: -1000 ~ -1999
    CollectionNotFound,
    // File errors: -2000 ~ -2999
    FileNotFound,
    // Bridge errors: -3000 ~ -3999
    HandleNotFound,
    ProtocolViolation,
    InvalidArgument,
    Unspecified,
}

impl ErrorCode {
    /// Stable numeric value sent to callers.
    pub fn value(self) -> i32 {
        match self {
            Self::VaultNotFound => -1,
            Self::ProviderNotPublished => -2,
            Self::DidNotPublished => -3,
            Self::CollectionNotFound => -1000,
            Self::FileNotFound => -2000,
            Self::HandleNotFound => -3000,
            Self::ProtocolViolation => -3001,
            Self::InvalidArgument => -3002,
            Self::Unspecified => -9999,
        }
    }

    /// Maps a wire value back to its code; unknown values become `Unspecified`.
    pub fn from_value(value: i32) -> Self {
        ALL_ERROR_CODES
            .iter()
            .copied()
            .find(|code| code.value() == value)
            .unwrap_or(Self::Unspecified)
    }

    /// Stable snake_case label used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VaultNotFound => "vault_not_found",
            Self::ProviderNotPublished => "provider_not_published",
            Self::DidNotPublished => "did_not_published",
            Self::CollectionNotFound => "collection_not_found",
            Self::FileNotFound => "file_not_found",
            Self::HandleNotFound => "handle_not_found",
            Self::ProtocolViolation => "protocol_violation",
            Self::InvalidArgument => "invalid_argument",
            Self::Unspecified => "unspecified",
        }
    }
}

const ALL_ERROR_CODES: &[ErrorCode] = &[
    ErrorCode::VaultNotFound,
    ErrorCode::ProviderNotPublished,
    ErrorCode::DidNotPublished,
    ErrorCode::CollectionNotFound,
    ErrorCode::FileNotFound,
    ErrorCode::HandleNotFound,
    ErrorCode::ProtocolViolation,
    ErrorCode::InvalidArgument,
    ErrorCode::Unspecified,
];

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.value())
    }
}

/// Coded failure delivered to the caller as `{code, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub message: String,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn handle_not_found(handle: impl Display) -> Self {
        Self::new(
            ErrorCode::HandleNotFound,
            format!("no live object for handle `{handle}`"),
        )
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolViolation, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// Caller wire shape.
    pub fn to_json(&self) -> Value {
        json!({
            "code": self.code.value(),
            "message": self.message,
        })
    }
}

impl Display for StructuredError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.value(), self.message)
    }
}

impl Error for StructuredError {}

pub type BackendResult<T> = Result<T, BackendError>;

/// Failure categories a backing collaborator can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    VaultNotFound,
    VaultAlreadyExists,
    ProviderNotSet,
    ProviderNotPublished,
    DidNotPublished,
    FileNotFound,
    Io,
    Auth,
    Other,
}

/// Failure value returned by backing collaborator operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Other, message)
    }

    pub fn is(&self, kind: BackendErrorKind) -> bool {
        self.kind == kind
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            return Self::new(BackendErrorKind::FileNotFound, value.to_string());
        }
        Self::new(BackendErrorKind::Io, value.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(value: serde_json::Error) -> Self {
        Self::other(format!("invalid json payload: {value}"))
    }
}
