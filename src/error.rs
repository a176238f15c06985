//! Error types for the key manager worker

use thiserror::Error;

/// Errors that can occur in the worker
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("keymanager: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("keymanager: no such status")]
    NoSuchStatus,

    #[error("keymanager: no such ephemeral secret")]
    NoSuchEphemeralSecret,

    #[error("registry: no such node")]
    NoSuchNode,

    #[error("keymanager: not authorized")]
    NotAuthorized,

    #[error("keymanager: unsupported RPC kind")]
    UnsupportedKind,

    #[error("keymanager: unknown TEE hardware: {0}")]
    UnknownTee(u8),

    #[error("keymanager: malformed response from enclave")]
    MalformedResponse,

    #[error("keymanager: enclave error: {0}")]
    Enclave(String),

    #[error("keymanager: call cancelled")]
    Cancelled,

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("runtime host error: {0}")]
    Host(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
