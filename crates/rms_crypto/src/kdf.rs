//! Key derivation: HKDF-SHA256.
//!
//! `hkdf(secret)` derives the 32-byte AES key used to seal one
//! `PeerDirectoryEntry` from an ECDH shared secret, per spec.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

pub const KEY_SHARE_INFO: &[u8] = b"recordmoney-key-share";

/// `hkdf(sha256, secret, salt="", info="recordmoney-key-share", 32) -> AES key`.
pub fn hkdf(secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    hkdf_expand(secret, &[], KEY_SHARE_INFO)
}

/// General HKDF-SHA256 expand with an explicit salt and info string.
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic() {
        let secret = [3u8; 32];
        assert_eq!(hkdf(&secret).unwrap(), hkdf(&secret).unwrap());
    }

    #[test]
    fn hkdf_differs_by_secret() {
        let a = hkdf(&[1u8; 32]).unwrap();
        let b = hkdf(&[2u8; 32]).unwrap();
        assert_ne!(a, b);
    }
}
