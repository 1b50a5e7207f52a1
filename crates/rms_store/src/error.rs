use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] rms_crypto::CryptoError),

    #[error("proto error: {0}")]
    Proto(#[from] rms_proto::ProtoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("migration error: {0}")]
    Migration(String),
}
