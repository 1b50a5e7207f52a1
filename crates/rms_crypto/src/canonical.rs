//! Canonical JSON encoding used for every signed payload.
//!
//! Rules (spec.md §4.1):
//! - object keys are lexicographically sorted;
//! - no insignificant whitespace;
//! - byte strings are tagged `{"__type":"Uint8Array","data":<base64>}`;
//! - numbers are encoded as JSON integers.
//!
//! `serde_json::Map` is backed by a `BTreeMap` (this crate does not enable
//! serde_json's `preserve_order` feature), so lexicographic key ordering
//! falls out of `serde_json::to_vec` for free — the canonicalization work
//! here is entirely in the `ByteField` wire shape.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;

/// Wraps a byte string so it serializes as the tagged
/// `{"__type":"Uint8Array","data":<base64>}` shape the wire format uses
/// for every byte field (keys, signatures, ciphertexts, IDs).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ByteField(pub Vec<u8>);

impl ByteField {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for ByteField {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for ByteField {
    fn from(v: &[u8]) -> Self {
        Self(v.to_vec())
    }
}

impl Serialize for ByteField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Tagged<'a> {
            __type: &'static str,
            data: &'a str,
        }
        let data = STANDARD.encode(&self.0);
        Tagged { __type: "Uint8Array", data: &data }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ByteField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Tagged {
            __type: String,
            data: String,
        }
        let tagged = Tagged::deserialize(deserializer)?;
        if tagged.__type != "Uint8Array" {
            return Err(D::Error::custom(format!(
                "expected __type \"Uint8Array\", got {:?}",
                tagged.__type
            )));
        }
        let bytes = STANDARD
            .decode(tagged.data)
            .map_err(|e| D::Error::custom(e.to_string()))?;
        Ok(ByteField(bytes))
    }
}

/// Plain base64-encoded byte string — no `__type` tag. Used for envelope
/// fields (manifests, chunk indices, ciphertexts) that are never
/// canonically hashed/signed themselves, per the literal wire shapes in
/// spec.md §6 (e.g. `"latestMutationId":"<b64 ciphertext>"`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Base64Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl Serialize for Base64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s)
            .map(Base64Bytes)
            .map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// Serialize `value` to canonical JSON bytes (sorted keys, no whitespace).
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    // Round-tripping through `Value` guarantees a `BTreeMap`-ordered map
    // representation regardless of the field declaration order on `T`.
    let v = serde_json::to_value(value).map_err(CryptoError::Serialisation)?;
    serde_json::to_vec(&v).map_err(CryptoError::Serialisation)
}

/// SHA-256 over the canonical JSON encoding of `value` — the digest every
/// mutation and certificate signature is computed over.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<[u8; 32], CryptoError> {
    let bytes = to_canonical_bytes(value)?;
    Ok(crate::hash::sha256(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::HashMap;

    #[test]
    fn key_order_is_independent_of_insertion_order() {
        let mut a = HashMap::new();
        a.insert("zeta", 1);
        a.insert("alpha", 2);
        a.insert("mid", 3);

        let mut b = HashMap::new();
        b.insert("mid", 3);
        b.insert("zeta", 1);
        b.insert("alpha", 2);

        assert_eq!(to_canonical_bytes(&a).unwrap(), to_canonical_bytes(&b).unwrap());
    }

    #[test]
    fn byte_field_round_trips() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Wrapper {
            key: ByteField,
        }
        let w = Wrapper { key: ByteField::new(vec![1, 2, 3, 255]) };
        let bytes = to_canonical_bytes(&w).unwrap();
        let json = String::from_utf8(bytes).unwrap();
        assert!(json.contains("\"__type\":\"Uint8Array\""));
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn canonical_bytes_has_no_whitespace() {
        #[derive(Serialize)]
        struct S {
            a: u32,
            b: u32,
        }
        let bytes = to_canonical_bytes(&S { a: 1, b: 2 }).unwrap();
        assert!(!bytes.contains(&b' '));
    }
}
