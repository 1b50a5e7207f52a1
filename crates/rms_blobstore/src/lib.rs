//! rms_blobstore — content-addressed blob store abstraction (spec.md §4.4)
//!
//! # Module layout
//! - `store`   — the `BlobStore` trait, `HttpGatewayBlobStore`, `InMemoryBlobStore`
//! - `gateway` — `GatewayManager`, the priority/penalty ranking over gateway URLs
//! - `cid`     — `CidManager`, per-logical-key CID history for best-effort unpinning
//! - `error`   — unified error type

pub mod cid;
pub mod error;
pub mod gateway;
pub mod store;

pub use cid::{CidHistoryEntry, CidManager};
pub use error::BlobStoreError;
pub use gateway::GatewayManager;
pub use store::{BlobStore, HttpGatewayBlobStore, InMemoryBlobStore, UploadResult};
