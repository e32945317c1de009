// src/error.rs — crate-wide error taxonomy
// Wire error codes (see wire::ErrorCode) are a narrow, stable projection of
// this enum; this enum is free to grow without touching the wire format.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity '{0}' is already registered")]
    DuplicateIdentity(String),

    #[error("identity '{0}' is not registered")]
    UnknownIdentity(String),

    #[error("id '{0}' exceeds the 49-byte wire limit")]
    IdTooLong(String),

    #[error("backup coherence check failed: expected next_reset={expected}, got {got}")]
    BackupCoherence { expected: u64, got: u64 },

    #[error("set already in progress for this identity")]
    SetInProgress,

    #[error("malformed wire frame: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, EngineError>;
