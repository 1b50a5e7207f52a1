use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob upload failed: {0}")]
    UploadFailed(String),

    #[error("blob fetch failed: {0}")]
    FetchFailed(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("rate limited by gateway")]
    RateLimited,

    #[error("gateway timed out")]
    Timeout,

    #[error("no gateways configured")]
    NoGateways,

    #[error("proto error: {0}")]
    Proto(#[from] rms_proto::ProtoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
