use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("crypto error: {0}")]
    Crypto(#[from] rms_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("bad timestamp: {0}")]
    BadTimestamp(String),

    #[error("malformed mutation: {0}")]
    MalformedMutation(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("chunk index has a gap or overlap: {0}")]
    ChunkIndexInvalid(String),

    #[error("peer directory entry not addressed to us")]
    NoMatchingDirectoryEntry,
}
