//! Storage error types.

use crate::ObjectId;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred in the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested object is absent from every source.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The object is known upstream but deliberately absent behind a
    /// shallow history boundary. Distinct from [`StorageError::ObjectNotFound`]
    /// so callers can explain the gap instead of reporting corruption.
    #[error("object {0} is behind a shallow boundary")]
    Shallow(ObjectId),

    /// The requested reference does not exist.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// A reference points at itself, directly or through a chain.
    #[error("symbolic ref cycle involving: {0}")]
    RefCycle(String),

    /// An object, pack, or index failed structural validation.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// An object id or object header could not be parsed.
    #[error("invalid object: {0}")]
    InvalidObject(String),
}
