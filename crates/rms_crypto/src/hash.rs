//! SHA-256 hash utilities.
//!
//! Used for device-ID derivation, mutation signing digests, and
//! content-addressing of mutable-name records.

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `deviceId = hex(sha256(authPublicKey))`, 64 lowercase hex characters.
pub fn derive_device_id(auth_public_key: &[u8]) -> String {
    hex::encode(sha256(auth_public_key))
}

/// `deriveName(namePub) = hex(sha256(namePub))` — the key a mutable-name
/// record is registered under on the blob store's naming layer.
pub fn derive_name(name_public_key: &[u8]) -> String {
    hex::encode(sha256(name_public_key))
}
