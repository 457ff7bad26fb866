//! Vault object storage for Haven.
//!
//! This crate provides content-addressed storage for vault history objects
//! (blobs, trees, commits), loose and packed on-disk layouts, and reference
//! management, all layered over a pluggable (in production, encrypted)
//! filesystem.

mod cache;
mod error;
mod fs;
mod object;
mod packfile;
mod refs;
mod store;
mod vault;

pub use cache::PackCache;
pub use error::StorageError;
pub use fs::{DirEntry, FileStat, LocalFs, MemFs, VaultFs};
pub use object::{CommitInfo, Ident, ObjectId, ObjectType, TreeEntry, VaultObject};
pub use packfile::{apply_delta, ExternalBaseResolver, LoadedPack, PackIndex, IDX_MAGIC};
pub use refs::RefStore;
pub use store::{ObjectSource, ObjectStore, ReadFormat, StoredObject};
pub use vault::Vault;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
