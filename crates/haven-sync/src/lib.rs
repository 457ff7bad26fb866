//! Vault synchronization engine for Haven.
//!
//! Implements the smart wire protocol two untrusted peers use to exchange
//! vault history: commit log walking with shallow semantics, pack building,
//! pkt-line and side-band framing, and the upload-pack negotiation itself.

mod error;
mod log;
mod pack;
mod pktline;
mod protocol;
mod sideband;

pub use error::SyncError;
pub use log::{log, LogEntry, LogResult};
pub use pack::{verify_pack, Ack, PackBuilder, PackResult};
pub use pktline::{PktLine, PktLineReader, PktLineWriter, MAX_PKT_PAYLOAD};
pub use protocol::{advertise_refs, upload_pack, Negotiation, UPLOAD_PACK_SERVICE};
pub use sideband::{SideBandChannel, SideBandReader, SideBandWriter, MAX_SIDE_BAND_PAYLOAD};

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
