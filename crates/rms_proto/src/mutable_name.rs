//! Mutable-name record format (spec.md §6) — for blob stores without
//! native mutable-name support, a signed pointer record resolved by
//! `deriveName(pub) = hex(sha256(pub))`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rms_crypto::{ed25519_sign, ed25519_verify, sha256, Ed25519PrivateKey, Ed25519PublicKey};

use crate::error::ProtoError;

/// `validityType` values. Only `Eol` (end-of-life validity, the only kind
/// this system emits) is in play; the field is carried for wire
/// compatibility with stores that define other validity types.
pub const VALIDITY_TYPE_EOL: u32 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableNameRecord {
    pub value: String,
    pub sequence: u64,
    pub validity: DateTime<Utc>,
    pub validity_type: u32,
    /// Hex-encoded Ed25519 signature over `value‖validity‖validityType‖sequence`.
    pub signature: String,
}

fn signing_bytes(value: &str, validity: DateTime<Utc>, validity_type: u32, sequence: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(validity.to_rfc3339().as_bytes());
    buf.extend_from_slice(validity_type.to_string().as_bytes());
    buf.extend_from_slice(sequence.to_string().as_bytes());
    buf
}

impl MutableNameRecord {
    /// `value` is `"/ipfs/<cid>"`.
    pub fn sign(
        cid: &str,
        sequence: u64,
        validity: DateTime<Utc>,
        private_key: &Ed25519PrivateKey,
    ) -> Self {
        let value = format!("/ipfs/{cid}");
        let bytes = signing_bytes(&value, validity, VALIDITY_TYPE_EOL, sequence);
        let signature = ed25519_sign(private_key, &bytes);
        Self {
            value,
            sequence,
            validity,
            validity_type: VALIDITY_TYPE_EOL,
            signature: hex::encode(signature),
        }
    }

    pub fn verify(&self, public_key: &Ed25519PublicKey) -> Result<(), ProtoError> {
        let bytes = signing_bytes(&self.value, self.validity, self.validity_type, self.sequence);
        let signature: [u8; 64] = hex::decode(&self.signature)
            .map_err(|_| ProtoError::MalformedMutation("mutable-name signature not valid hex".into()))?
            .try_into()
            .map_err(|_| ProtoError::MalformedMutation("mutable-name signature wrong length".into()))?;
        ed25519_verify(public_key, &bytes, &signature).map_err(|_| ProtoError::SignatureInvalid)
    }

    /// The CID this record's `value` field points at, stripped of the
    /// `/ipfs/` prefix.
    pub fn cid(&self) -> Option<&str> {
        self.value.strip_prefix("/ipfs/")
    }
}

/// `deriveName(pub) = hex(sha256(pub))` — the lookup key a `BlobStore`
/// registers mutable-name records under.
pub fn derive_name(public_key_bytes: &[u8]) -> String {
    hex::encode(sha256(public_key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rms_crypto::generate_ed25519_keypair;

    #[test]
    fn sign_then_verify_succeeds() {
        let (private, public) = generate_ed25519_keypair();
        let record = MutableNameRecord::sign("bafy123", 1, Utc::now(), &private);
        assert!(record.verify(&public).is_ok());
        assert_eq!(record.cid(), Some("bafy123"));
    }

    #[test]
    fn tampered_sequence_fails_verification() {
        let (private, public) = generate_ed25519_keypair();
        let mut record = MutableNameRecord::sign("bafy123", 1, Utc::now(), &private);
        record.sequence = 2;
        assert!(record.verify(&public).is_err());
    }

    #[test]
    fn derive_name_is_stable_hex() {
        let key = vec![9u8; 32];
        let a = derive_name(&key);
        let b = derive_name(&key);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
