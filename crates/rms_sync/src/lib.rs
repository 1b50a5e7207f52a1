//! rms_sync — device setup, pairing, group service, publishing, the sync
//! engine, conflict handling, and legacy migration (spec.md §4.5-§4.11).
//!
//! # Module layout
//! - `context`  — `SyncContext`, the handle every entry point takes
//! - `config`   — `EngineConfig`, `SyncConfig`'s backoff schedule
//! - `device`   — device key bootstrap, `setupDevice`, reset
//! - `pairing`  — device-to-device QR pairing handshake (spec.md §4.6)
//! - `group`    — group lifecycle: create, invite, remove, exit, fork (§4.7)
//! - `publish`  — `publishPendingMutations` (§4.8)
//! - `conflict` — conflict detection/resolution, malformed content, device
//!   removal, self-wipe (§4.10)
//! - `migration` — one-shot legacy-data import (§4.11)
//! - `engine`   — the scheduled sync loop tying the above together (§4.9)
//! - `error`    — `SyncError`, `ResultEnvelope` (§7)

pub mod config;
pub mod conflict;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod group;
pub mod migration;
pub mod pairing;
pub mod publish;

pub use config::{EngineConfig, SyncConfig};
pub use context::SyncContext;
pub use engine::{SyncEngine, SyncEvent};
pub use error::{ErrorEnvelope, ErrorKind, ResultEnvelope, SyncError};
