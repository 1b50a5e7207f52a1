//! `SyncError` and the `{success, ..., error}` result envelope (spec.md §7).

use serde::Serialize;
use thiserror::Error;

/// The literal error kinds spec.md §7 enumerates. Every leaf error
/// (crypto, proto, blob-store, store) maps onto one of these at the
/// public-entry-point boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotConfigured,
    ProviderInvalid,
    BlobUploadFailed,
    BlobFetchFailed,
    BlobNotFound,
    RateLimited,
    Timeout,
    CryptoDecryptFailed,
    SignatureInvalid,
    UnknownAuthor,
    BadTimestamp,
    MalformedMutation,
    SessionExpired,
    EmojisRejected,
    ConflictDetected,
    MigrationFailed,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not configured")]
    NotConfigured,

    #[error("provider configuration invalid: {0}")]
    ProviderInvalid(String),

    #[error(transparent)]
    Blob(#[from] rms_blobstore::BlobStoreError),

    #[error(transparent)]
    Proto(#[from] rms_proto::ProtoError),

    #[error(transparent)]
    Crypto(#[from] rms_crypto::CryptoError),

    #[error(transparent)]
    Store(#[from] rms_store::StoreError),

    #[error("serialisation failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pairing/invite session expired")]
    SessionExpired,

    #[error("emoji fingerprints did not match, pairing rejected")]
    EmojisRejected,

    #[error("conflict detected on target {0}")]
    ConflictDetected(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("publish already in progress")]
    PublishInProgress,

    #[error("sync already in progress")]
    SyncInProgress,

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotConfigured => ErrorKind::NotConfigured,
            SyncError::ProviderInvalid(_) => ErrorKind::ProviderInvalid,
            SyncError::Blob(rms_blobstore::BlobStoreError::UploadFailed(_)) => ErrorKind::BlobUploadFailed,
            SyncError::Blob(rms_blobstore::BlobStoreError::FetchFailed(_)) => ErrorKind::BlobFetchFailed,
            SyncError::Blob(rms_blobstore::BlobStoreError::NotFound(_)) => ErrorKind::BlobNotFound,
            SyncError::Blob(rms_blobstore::BlobStoreError::RateLimited) => ErrorKind::RateLimited,
            SyncError::Blob(rms_blobstore::BlobStoreError::Timeout) => ErrorKind::Timeout,
            SyncError::Blob(_) => ErrorKind::BlobFetchFailed,
            SyncError::Crypto(_) => ErrorKind::CryptoDecryptFailed,
            SyncError::Proto(rms_proto::ProtoError::SignatureInvalid) => ErrorKind::SignatureInvalid,
            SyncError::Proto(rms_proto::ProtoError::BadTimestamp(_)) => ErrorKind::BadTimestamp,
            SyncError::Proto(rms_proto::ProtoError::MalformedMutation(_)) => ErrorKind::MalformedMutation,
            SyncError::Proto(_) => ErrorKind::MalformedMutation,
            SyncError::Store(_) => ErrorKind::MalformedMutation,
            SyncError::Json(_) => ErrorKind::MalformedMutation,
            SyncError::SessionExpired => ErrorKind::SessionExpired,
            SyncError::EmojisRejected => ErrorKind::EmojisRejected,
            SyncError::ConflictDetected(_) => ErrorKind::ConflictDetected,
            SyncError::MigrationFailed(_) => ErrorKind::MigrationFailed,
            SyncError::PublishInProgress | SyncError::SyncInProgress | SyncError::Other(_) => {
                ErrorKind::MalformedMutation
            }
        }
    }
}

/// The `{success, ..., error}` shape every public entry point returns
/// (spec.md §7). `T` is the operation-specific payload on success.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
}

impl<T: Serialize> ResultEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn err(error: &SyncError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorEnvelope { kind: error.kind(), message: error.to_string() }),
        }
    }

    /// Convert a `Result` at a public entry point into its wire envelope,
    /// per spec.md §7's "components transform to result envelopes at
    /// every public entry".
    pub fn from_result(result: Result<T, SyncError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(&e),
        }
    }
}
