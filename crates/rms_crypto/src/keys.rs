//! Asymmetric and symmetric key types.
//!
//! Per device (persistent): one P-256 keypair (`authPublicKey`, ECDSA+ECDH)
//! and one Ed25519 keypair (`ipnsPublicKey`, mutable-name handle + record
//! signing). Symmetric keys (`PersonalKey`, `BroadcastKey`, `GroupKey`,
//! handshake temp keys) are flat 32-byte CSPRNG outputs.

use ed25519_dalek::{Signer, SigningKey as EdSigningKey, Verifier, VerifyingKey as EdVerifyingKey};
use elliptic_curve::sec1::ToEncodedPoint;
use p256::ecdsa::{
    signature::hazmat::{PrehashSigner, PrehashVerifier},
    Signature as EcdsaSignature, SigningKey as EcdsaSigningKey, VerifyingKey as EcdsaVerifyingKey,
};
use p256::{PublicKey as P256PublicKeyInner, SecretKey as P256SecretKeyInner};
use rand::RngCore;
use rand_core::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

pub const P256_PUBLIC_KEY_LEN: usize = 65; // uncompressed SEC1 point
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;
pub const SYMMETRIC_KEY_LEN: usize = 32;

// ── P-256 (ECDSA + ECDH) ──────────────────────────────────────────────────────

/// Device's persistent P-256 private key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct P256PrivateKey(P256SecretKeyInner);

impl P256PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        P256SecretKeyInner::from_slice(bytes)
            .map(P256PrivateKey)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn public_key(&self) -> P256PublicKey {
        P256PublicKey(self.0.public_key())
    }
}

/// 65-byte uncompressed SEC1 P-256 public key — `authPublicKey` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P256PublicKey(P256PublicKeyInner);

impl P256PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != P256_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "P-256 public key must be {P256_PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        P256PublicKeyInner::from_sec1_bytes(bytes)
            .map(P256PublicKey)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn to_bytes(&self) -> [u8; P256_PUBLIC_KEY_LEN] {
        let point = self.0.to_encoded_point(false);
        let mut out = [0u8; P256_PUBLIC_KEY_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }

}

/// Generate a fresh P-256 keypair from the OS CSPRNG.
pub fn generate_p256_keypair() -> (P256PrivateKey, P256PublicKey) {
    let secret = P256SecretKeyInner::random(&mut OsRng);
    let public = P256PublicKey(secret.public_key());
    (P256PrivateKey(secret), public)
}

/// `ecdhP256(priv, pub) -> 32 bytes` — the shared secret's X-coordinate.
pub fn ecdh_p256(private: &P256PrivateKey, public: &P256PublicKey) -> [u8; 32] {
    let shared = elliptic_curve::ecdh::diffie_hellman(
        private.0.to_nonzero_scalar(),
        public.0.as_affine(),
    );
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    out
}

/// `ecdsaSignP256(priv, digest) -> 64-byte r‖s`. `digest` is the SHA-256
/// of the canonical JSON being signed (spec.md §4.1); this function signs
/// the pre-hashed digest directly rather than re-hashing it.
pub fn ecdsa_sign_p256(private: &P256PrivateKey, digest: &[u8; 32]) -> Result<[u8; 64], CryptoError> {
    let signing_key = EcdsaSigningKey::from_bytes(&private.0.to_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig: EcdsaSignature = signing_key
        .sign_prehash(digest)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let mut out = [0u8; 64];
    out.copy_from_slice(&sig.to_bytes());
    Ok(out)
}

/// `ecdsaVerifyP256(pub, digest, sig)`.
pub fn ecdsa_verify_p256(
    public: &P256PublicKey,
    digest: &[u8; 32],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let verifying_key = EcdsaVerifyingKey::from_sec1_bytes(&public.to_bytes())
        .map_err(|_| CryptoError::InvalidKey("bad P-256 public key".into()))?;
    let sig = EcdsaSignature::from_slice(signature)
        .map_err(|_| CryptoError::SignatureVerification)?;
    verifying_key
        .verify_prehash(digest, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

// ── Ed25519 (mutable-name / ipns keys) ────────────────────────────────────────

/// Device's persistent Ed25519 private key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct Ed25519PrivateKey(EdSigningKey);

impl Ed25519PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Ed25519 private key must be 32 bytes".into()))?;
        Ok(Self(EdSigningKey::from_bytes(&arr)))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.0.sign(msg).to_bytes()
    }
}

/// 32-byte Ed25519 public key — `ipnsPublicKey` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519PublicKey(EdVerifyingKey);

impl Ed25519PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Ed25519 public key must be 32 bytes".into()))?;
        EdVerifyingKey::from_bytes(&arr)
            .map(Ed25519PublicKey)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn to_bytes(&self) -> [u8; ED25519_PUBLIC_KEY_LEN] {
        self.0.to_bytes()
    }
}

/// Generate a fresh Ed25519 keypair from the OS CSPRNG.
pub fn generate_ed25519_keypair() -> (Ed25519PrivateKey, Ed25519PublicKey) {
    let signing_key = EdSigningKey::generate(&mut OsRng);
    let public = Ed25519PublicKey(signing_key.verifying_key());
    (Ed25519PrivateKey(signing_key), public)
}

/// `ed25519Sign(priv, msg) -> 64-byte signature`.
pub fn ed25519_sign(private: &Ed25519PrivateKey, msg: &[u8]) -> [u8; 64] {
    private.sign(msg)
}

/// `ed25519Verify(pub, msg, sig)`.
pub fn ed25519_verify(public: &Ed25519PublicKey, msg: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    public
        .0
        .verify(msg, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

// ── Symmetric keys ────────────────────────────────────────────────────────────

/// `generateSymmetricKey() -> 32 random bytes` (PersonalKey / BroadcastKey /
/// GroupKey / handshake temp key material).
pub fn generate_symmetric_key() -> [u8; SYMMETRIC_KEY_LEN] {
    let mut key = [0u8; SYMMETRIC_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_is_symmetric() {
        let (priv_a, pub_a) = generate_p256_keypair();
        let (priv_b, pub_b) = generate_p256_keypair();
        assert_eq!(ecdh_p256(&priv_a, &pub_b), ecdh_p256(&priv_b, &pub_a));
    }

    #[test]
    fn ecdsa_sign_verify_roundtrip() {
        let (private, public) = generate_p256_keypair();
        let digest = crate::hash::sha256(b"hello mutation");
        let sig = ecdsa_sign_p256(&private, &digest).unwrap();
        assert!(ecdsa_verify_p256(&public, &digest, &sig).is_ok());
    }

    #[test]
    fn ecdsa_verify_fails_for_wrong_key() {
        let (private, _) = generate_p256_keypair();
        let (_, other_public) = generate_p256_keypair();
        let digest = crate::hash::sha256(b"hello mutation");
        let sig = ecdsa_sign_p256(&private, &digest).unwrap();
        assert!(ecdsa_verify_p256(&other_public, &digest, &sig).is_err());
    }

    #[test]
    fn ecdsa_verify_fails_on_bit_flip() {
        let (private, public) = generate_p256_keypair();
        let digest_a = crate::hash::sha256(b"hello mutation");
        let digest_b = crate::hash::sha256(b"hello mutatioN");
        let sig = ecdsa_sign_p256(&private, &digest_a).unwrap();
        assert!(ecdsa_verify_p256(&public, &digest_b, &sig).is_err());
    }

    #[test]
    fn ed25519_sign_verify_roundtrip() {
        let (private, public) = generate_ed25519_keypair();
        let sig = ed25519_sign(&private, b"ipns record value");
        assert!(ed25519_verify(&public, b"ipns record value", &sig).is_ok());
    }

    #[test]
    fn p256_public_key_bytes_roundtrip() {
        let (_, public) = generate_p256_keypair();
        let bytes = public.to_bytes();
        assert_eq!(bytes.len(), P256_PUBLIC_KEY_LEN);
        let back = P256PublicKey::from_bytes(&bytes).unwrap();
        assert_eq!(back, public);
    }

    #[test]
    fn device_id_is_64_hex_chars() {
        let (_, public) = generate_p256_keypair();
        let id = crate::hash::derive_device_id(&public.to_bytes());
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
