//! rms_store — the concrete local persistence layer backing the sync
//! engine's `deviceKeys`, `syncConfig`, `mutationQueue`, `groupKeys`,
//! `peerSyncStates`, `conflicts`, `pendingInvites`, and `cidHistory`
//! tables (spec.md §6), plus the legacy tables C11 migrates from.
//!
//! Device private keys and symmetric keys are stored as raw bytes; they
//! never leave this database and are never logged (spec.md §5 "Resource
//! policy"). There is no independent at-rest encryption layer here — the
//! cryptographic schema this system specifies governs data published to
//! the blob-store network, not this local file.

pub mod db;
pub mod error;
pub mod migrations;
pub mod models;

pub use db::Store;
pub use error::StoreError;
