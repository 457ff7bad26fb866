//! Haven node: serves vault history to authorized peers over HTTP.
//!
//! The node exposes the fetch side of the vault sync protocol — ref
//! advertisement and upload-pack — on top of [`haven_storage`] vaults and
//! the [`haven_sync`] wire implementation.
//!
//! - [`api`] - HTTP routes and the vault registry
//! - [`access`] - per-vault peer authorization
//! - [`config`] - node configuration

pub mod access;
pub mod api;
pub mod config;

pub use access::{AccessControl, AllowAll, PeerId, StaticAcl};
pub use api::{create_router, AppState, VaultRegistry, PEER_HEADER};
pub use config::Config;
