//! # Error Types
//!
//! Defines a structured error hierarchy for the push/version storage engine
//! using `thiserror`. Each variant corresponds to one of the error kinds the
//! engine surfaces to its callers: a transport layer maps these to status
//! codes, but none of that mapping lives here.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for every fallible operation the engine exposes.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Actor lacks the required capability for the operation.
    ///
    /// Callers that need to avoid leaking the existence of a project or
    /// version to an unauthorized actor should translate this to a 404, not
    /// a 403 — that policy belongs to the transport layer, not here.
    #[error("permission denied")]
    PermissionDenied,

    /// No such entity, or the entity is not visible to the requesting actor.
    #[error("not found: {0}")]
    NotFound(String),

    /// A state-machine transition was attempted that isn't legal from the
    /// entity's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A declared content hash disagreed with the hash computed while
    /// streaming the content.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    /// A manifest entry references a blob whose payload is absent from the
    /// `FileStore`.
    #[error("blob missing: {hash}")]
    BlobMissing { hash: String },

    /// A manifest failed to decode, or is missing required fields.
    #[error("manifest corrupt: {0}")]
    ManifestCorrupt(String),

    /// The underlying `FileStore` refused an operation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A worker observed cancellation at a checkpoint and aborted.
    #[error("cancelled")]
    Cancelled,

    /// Configuration could not be found, parsed, or validated.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Anything else; the call site is expected to have logged context
    /// before returning this.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_state(what: impl Into<String>) -> Self {
        Self::InvalidState(what.into())
    }

    pub fn internal(what: impl Into<String>) -> Self {
        Self::Internal(what.into())
    }
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found (searched: {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {message}")]
    Validation { message: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
