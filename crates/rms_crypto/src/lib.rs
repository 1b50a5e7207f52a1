//! rms_crypto — recordmoney sync cryptographic primitives
//!
//! # Design principles
//! - No custom crypto; every primitive comes from an audited Rust crate.
//! - Secret material is zeroized on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `keys`      — P-256 (ECDSA+ECDH) and Ed25519 keypairs, symmetric keys
//! - `aead`      — AES-256-GCM encrypt/decrypt helpers
//! - `kdf`       — HKDF-SHA256 key derivation
//! - `hash`      — SHA-256 utilities (device IDs, mutable-name handles)
//! - `canonical` — canonical JSON encoding + the `Uint8Array` byte-field tag
//! - `emoji`     — 6-emoji pairing/invite fingerprints
//! - `error`     — unified error type

pub mod aead;
pub mod canonical;
pub mod emoji;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keys;

pub use canonical::{canonical_digest, to_canonical_bytes, Base64Bytes, ByteField};
pub use error::CryptoError;
pub use hash::sha256;
pub use kdf::{hkdf, hkdf_expand};
pub use keys::{
    ecdh_p256, ecdsa_sign_p256, ecdsa_verify_p256, ed25519_sign, ed25519_verify,
    generate_ed25519_keypair, generate_p256_keypair, generate_symmetric_key, Ed25519PrivateKey,
    Ed25519PublicKey, P256PrivateKey, P256PublicKey,
};
