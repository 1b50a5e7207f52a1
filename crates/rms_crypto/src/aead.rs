//! Authenticated Encryption with Associated Data
//!
//! Uses AES-256-GCM with a 96-bit (12-byte) IV, per spec.
//! Key size: 32 bytes.  IV: 12 bytes (random).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ iv (12 bytes) | ciphertext + tag ]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const IV_LEN: usize = 12;

/// Encrypt `plaintext` with a 32-byte key, prepending a random 12-byte IV.
/// `aad` is authenticated but not encrypted.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let iv = Aes256Gcm::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&iv, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (iv || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < IV_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (iv_bytes, ct) = data.split_at(IV_LEN);
    let iv = Nonce::from_slice(iv_bytes);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(iv, Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Encrypt a 32-byte key with another 32-byte wrapping key (key transport).
pub fn wrap_key(wrap_key: &[u8; 32], key_to_wrap: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    encrypt(wrap_key, key_to_wrap, b"recordmoney-key-wrap")
}

/// Decrypt a wrapped key.
pub fn unwrap_key(wrap_key: &[u8; 32], wrapped: &[u8]) -> Result<[u8; 32], CryptoError> {
    let plaintext = decrypt(wrap_key, wrapped, b"recordmoney-key-wrap")?;
    if plaintext.len() != 32 {
        return Err(CryptoError::InvalidKey("unwrapped key wrong length".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let pt = b"personal ledger mutation chunk";
        let ct = encrypt(&key, pt, b"aad").unwrap();
        let back = decrypt(&key, &ct, b"aad").unwrap();
        assert_eq!(&back[..], pt);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key = [7u8; 32];
        let other = [9u8; 32];
        let ct = encrypt(&key, b"hello", b"").unwrap();
        assert!(decrypt(&other, &ct, b"").is_err());
    }

    #[test]
    fn decrypt_with_wrong_aad_fails() {
        let key = [7u8; 32];
        let ct = encrypt(&key, b"hello", b"aad-a").unwrap();
        assert!(decrypt(&key, &ct, b"aad-b").is_err());
    }
}
