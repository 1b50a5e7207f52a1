//! rms_proto — wire types for the recordmoney sync protocol.
//!
//! # Modules
//! - `mutation`     — the signed, field-granular mutation log (spec.md §4.3)
//! - `envelope`      — DeviceManifest/GroupManifest/DeviceRing/PeerDirectory/
//!   ChunkIndex/MutationChunk (spec.md §4.2, §6)
//! - `group`         — group/invite/conflict wire types (spec.md §4.7, §4.10)
//! - `pairing`       — QR payload and pairing-response formats (spec.md §4.6, §6)
//! - `mutable_name`  — signed mutable-name record format (spec.md §6)
//! - `error`         — unified error type

pub mod envelope;
pub mod error;
pub mod group;
pub mod mutable_name;
pub mod mutation;
pub mod pairing;

pub use envelope::{
    chunks_to_sync, validate_chunk_index, ChunkIndex, ChunkIndexEntry, DeviceManifest, DeviceRing,
    DeviceRingEntry, GroupManifest, MutationChunk, PeerDirectory, PeerDirectoryEntry,
    PeerDirectoryPayload, SharedGroup,
};
pub use error::ProtoError;
pub use group::{
    Conflict, ConflictOption, ConflictStatus, Group, InviteScope, PairingSessionState,
    PendingInvite, PERSONAL_LEDGER_GROUP_NAME,
};
pub use mutable_name::{derive_name, MutableNameRecord};
pub use mutation::{
    ArrayChange, ArrayOpKind, ConflictKind, FieldChange, Mutation, Operation, ScalarChange,
    TargetType, PROTOCOL_VERSION,
};
pub use pairing::{GroupInvitePayload, PairingResponse, QrPayload};
