//! Shared error taxonomy for every StellarOps subsystem.
//!
//! Every caller-visible operation returns `Result<T>` where the error side is
//! a `StellarError { kind, message, source }`. The `kind` is the thing tests
//! and callers branch on; `message`/`source` are for logs and diagnostics.

use thiserror::Error;

/// The fixed vocabulary of failure classes a subsystem can report.
///
/// Kept as a flat enum (not per-subsystem error types) because the FSMs and
/// contracts of this system are specified in terms of these kinds, not of
/// where in the code they originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidStatus,
    Validation,
    Transient,
    Timeout,
    CircuitOpen,
    NoGroundStation,
    ParseError,
    AlreadyExists,
    Exception,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidStatus => "invalid_status",
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::NoGroundStation => "no_ground_station",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Exception => "exception",
        };
        f.write_str(s)
    }
}

/// `{err, {kind, details}}` as a concrete Rust type.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct StellarError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StellarError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what)
    }

    pub fn validation(why: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, why)
    }

    pub fn invalid_status(why: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidStatus, why)
    }

    pub fn timeout(why: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, why)
    }

    pub fn transient(why: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, why)
    }

    pub fn parse_error(why: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, why)
    }
}

pub type Result<T> = std::result::Result<T, StellarError>;
