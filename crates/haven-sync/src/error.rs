//! Sync engine error types.

use thiserror::Error;

/// Errors that can occur while synchronizing vault history.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid pack file structure.
    #[error("invalid pack file: {0}")]
    InvalidPack(String),

    /// Invalid pkt-line framing.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Malformed negotiation or request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] haven_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
