//! Encrypted container formats: `DeviceManifest`, `GroupManifest`,
//! `DeviceRing`, `PeerDirectory`, `ChunkIndex`, `MutationChunk`
//! (spec.md §3, §4.2, §6).

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use rms_crypto::{aead, ecdh_p256, hkdf, Base64Bytes, P256PrivateKey, P256PublicKey};

use crate::error::ProtoError;
use crate::mutation::Mutation;

// ── ChunkIndex ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkIndexEntry {
    pub start_id: u64,
    pub end_id: u64,
    pub cid: String,
}

pub type ChunkIndex = Vec<ChunkIndexEntry>;

/// A `ChunkIndex` must cover `[1..latestMutationId]` without gaps or
/// overlap (spec.md §3, §8).
pub fn validate_chunk_index(index: &ChunkIndex, latest_mutation_id: u64) -> Result<(), ProtoError> {
    if latest_mutation_id == 0 {
        return if index.is_empty() {
            Ok(())
        } else {
            Err(ProtoError::ChunkIndexInvalid("non-empty index for zero mutations".into()))
        };
    }
    let mut sorted = index.to_vec();
    sorted.sort_by_key(|e| e.start_id);
    let mut expected_next = 1u64;
    for entry in &sorted {
        if entry.start_id != expected_next {
            return Err(ProtoError::ChunkIndexInvalid(format!(
                "expected next chunk to start at {expected_next}, got {}",
                entry.start_id
            )));
        }
        if entry.end_id < entry.start_id {
            return Err(ProtoError::ChunkIndexInvalid("endId before startId".into()));
        }
        expected_next = entry.end_id + 1;
    }
    if expected_next != latest_mutation_id + 1 {
        return Err(ProtoError::ChunkIndexInvalid(format!(
            "index covers up to {}, expected {latest_mutation_id}",
            expected_next.saturating_sub(1)
        )));
    }
    Ok(())
}

/// Which chunks in `index` cover mutations newer than `last_synced_id`.
pub fn chunks_to_sync(index: &ChunkIndex, last_synced_id: u64) -> Vec<ChunkIndexEntry> {
    index.iter().filter(|c| c.end_id > last_synced_id).cloned().collect()
}

// ── MutationChunk ─────────────────────────────────────────────────────────────

/// Ordered list of mutations all authored by one device, encrypted with
/// that device's `PersonalKey` (owner devices) or the `GroupKey` (group
/// history).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationChunk {
    pub mutations: Vec<Mutation>,
}

const CHUNK_AAD: &[u8] = b"recordmoney-chunk-v1";

impl MutationChunk {
    pub fn encrypt(&self, key: &[u8; 32]) -> Result<Vec<u8>, ProtoError> {
        let bytes = rms_crypto::to_canonical_bytes(self)?;
        Ok(aead::encrypt(key, &bytes, CHUNK_AAD)?)
    }

    pub fn decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Self, ProtoError> {
        let plaintext = aead::decrypt(key, ciphertext, CHUNK_AAD)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

// ── DeviceRing ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRingEntry {
    pub device_id: String,
    pub auth_public_key: Base64Bytes,
    pub ipns_public_key: Base64Bytes,
    /// Present only for the publishing device's own entry at publish time.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_synced_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRing {
    pub devices: Vec<DeviceRingEntry>,
}

const RING_AAD: &[u8] = b"recordmoney-ring-v1";

impl DeviceRing {
    pub fn encrypt(&self, broadcast_key: &[u8; 32]) -> Result<Vec<u8>, ProtoError> {
        let bytes = rms_crypto::to_canonical_bytes(self)?;
        Ok(aead::encrypt(broadcast_key, &bytes, RING_AAD)?)
    }

    pub fn decrypt(broadcast_key: &[u8; 32], ciphertext: &[u8]) -> Result<Self, ProtoError> {
        let plaintext = aead::decrypt(broadcast_key, ciphertext, RING_AAD)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    pub fn contains_device(&self, device_id: &str) -> bool {
        self.devices.iter().any(|d| d.device_id == device_id)
    }
}

// ── PeerDirectory ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedGroup {
    pub group_uuid: String,
    pub group_key: Base64Bytes,
}

/// The plaintext payload sealed inside one `PeerDirectoryEntry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDirectoryPayload {
    /// Only present for entries addressed to the owner's own devices.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub personal_key: Option<Base64Bytes>,
    pub broadcast_key: Base64Bytes,
    pub shared_groups: Vec<SharedGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDirectoryEntry {
    pub recipient_public_key: Base64Bytes,
    pub ciphertext: Base64Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PeerDirectory {
    pub entries: Vec<PeerDirectoryEntry>,
}

const DIRECTORY_AAD: &[u8] = b"recordmoney-peer-directory-v1";

impl PeerDirectory {
    /// Build a directory from `(recipient, payload)` pairs, ECDH-sealing
    /// each entry for its recipient and shuffling the result to deny
    /// ordering inference (spec.md §4.2).
    pub fn build(
        sender_private_key: &P256PrivateKey,
        recipients: &[(P256PublicKey, PeerDirectoryPayload)],
    ) -> Result<Self, ProtoError> {
        let mut entries: Vec<PeerDirectoryEntry> = recipients
            .iter()
            .map(|(recipient_pub, payload)| {
                let shared = ecdh_p256(sender_private_key, recipient_pub);
                let aes_key = hkdf(&shared)?;
                let plaintext = rms_crypto::to_canonical_bytes(payload)?;
                let ciphertext = aead::encrypt(&aes_key, &plaintext, DIRECTORY_AAD)?;
                Ok(PeerDirectoryEntry {
                    recipient_public_key: Base64Bytes::new(recipient_pub.to_bytes().to_vec()),
                    ciphertext: Base64Bytes::new(ciphertext),
                })
            })
            .collect::<Result<_, ProtoError>>()?;
        entries.shuffle(&mut OsRng);
        Ok(Self { entries })
    }

    /// Scan for the entry addressed to `my_public_key` and decrypt it
    /// against the claimed `sender_public_key`. Readers who cannot find
    /// a matching entry simply ignore the directory — decrypt failures
    /// here are not errors worth surfacing (spec.md §7).
    pub fn decrypt_for(
        &self,
        my_private_key: &P256PrivateKey,
        my_public_key: &P256PublicKey,
        sender_public_key: &P256PublicKey,
    ) -> Result<PeerDirectoryPayload, ProtoError> {
        let my_bytes = my_public_key.to_bytes();
        let entry = self
            .entries
            .iter()
            .find(|e| e.recipient_public_key.as_slice() == my_bytes.as_slice())
            .ok_or(ProtoError::NoMatchingDirectoryEntry)?;

        let shared = ecdh_p256(my_private_key, sender_public_key);
        let aes_key = hkdf(&shared)?;
        let plaintext = aead::decrypt(&aes_key, entry.ciphertext.as_slice(), DIRECTORY_AAD)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

// ── DeviceManifest / GroupManifest ───────────────────────────────────────────

/// One per device, pointed to by the device's mutable name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceManifest {
    pub database_cid: String,
    /// AES-GCM(PersonalKey, latestMutationId), opaque to outsiders.
    pub latest_mutation_id: Base64Bytes,
    /// AES-GCM(PersonalKey, canonicalJson(ChunkIndex)).
    pub chunk_index: Base64Bytes,
    pub device_ring_cid: String,
    pub peer_directory_cid: String,
}

const LATEST_ID_AAD: &[u8] = b"recordmoney-latest-id-v1";

impl DeviceManifest {
    pub fn encrypt_latest_mutation_id(key: &[u8; 32], latest_mutation_id: u64) -> Result<Base64Bytes, ProtoError> {
        let ciphertext = aead::encrypt(key, &latest_mutation_id.to_le_bytes(), LATEST_ID_AAD)?;
        Ok(Base64Bytes::new(ciphertext))
    }

    pub fn decrypt_latest_mutation_id(key: &[u8; 32], field: &Base64Bytes) -> Result<u64, ProtoError> {
        let plaintext = aead::decrypt(key, field.as_slice(), LATEST_ID_AAD)?;
        let bytes: [u8; 8] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| ProtoError::MalformedMutation("latestMutationId not 8 bytes".into()))?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn encrypt_chunk_index(key: &[u8; 32], index: &ChunkIndex) -> Result<Base64Bytes, ProtoError> {
        let bytes = rms_crypto::to_canonical_bytes(index)?;
        let ciphertext = aead::encrypt(key, &bytes, CHUNK_AAD)?;
        Ok(Base64Bytes::new(ciphertext))
    }

    pub fn decrypt_chunk_index(key: &[u8; 32], field: &Base64Bytes) -> Result<ChunkIndex, ProtoError> {
        let plaintext = aead::decrypt(key, field.as_slice(), CHUNK_AAD)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Group-level manifest, encrypted with the `GroupKey`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupManifest {
    pub group_uuid: String,
    pub database_cid: String,
    pub latest_mutation_id: Base64Bytes,
    pub chunk_index: Base64Bytes,
    pub peer_directory_cid: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{Operation, TargetType};
    use rms_crypto::generate_p256_keypair;

    #[test]
    fn peer_directory_round_trip_for_matching_recipient() {
        let (sender_priv, sender_pub) = generate_p256_keypair();
        let (recipient_priv, recipient_pub) = generate_p256_keypair();
        let (_, other_pub) = generate_p256_keypair();

        let payload = PeerDirectoryPayload {
            personal_key: Some(Base64Bytes::new(vec![1u8; 32])),
            broadcast_key: Base64Bytes::new(vec![2u8; 32]),
            shared_groups: vec![],
        };

        let directory = PeerDirectory::build(
            &sender_priv,
            &[
                (recipient_pub.clone(), payload.clone()),
                (
                    other_pub,
                    PeerDirectoryPayload {
                        personal_key: None,
                        broadcast_key: Base64Bytes::new(vec![9u8; 32]),
                        shared_groups: vec![],
                    },
                ),
            ],
        )
        .unwrap();

        let decoded = directory.decrypt_for(&recipient_priv, &recipient_pub, &sender_pub).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn peer_directory_no_match_is_explicit() {
        let (sender_priv, sender_pub) = generate_p256_keypair();
        let (_, recipient_pub) = generate_p256_keypair();
        let (unmatched_priv, unmatched_pub) = generate_p256_keypair();

        let directory = PeerDirectory::build(
            &sender_priv,
            &[(
                recipient_pub,
                PeerDirectoryPayload {
                    personal_key: None,
                    broadcast_key: Base64Bytes::new(vec![3u8; 32]),
                    shared_groups: vec![],
                },
            )],
        )
        .unwrap();

        assert!(matches!(
            directory.decrypt_for(&unmatched_priv, &unmatched_pub, &sender_pub),
            Err(ProtoError::NoMatchingDirectoryEntry)
        ));
    }

    #[test]
    fn chunk_index_validates_contiguous_coverage() {
        let index = vec![
            ChunkIndexEntry { start_id: 1, end_id: 5, cid: "a".into() },
            ChunkIndexEntry { start_id: 6, end_id: 10, cid: "b".into() },
        ];
        assert!(validate_chunk_index(&index, 10).is_ok());
    }

    #[test]
    fn chunk_index_rejects_gap() {
        let index = vec![
            ChunkIndexEntry { start_id: 1, end_id: 5, cid: "a".into() },
            ChunkIndexEntry { start_id: 7, end_id: 10, cid: "b".into() },
        ];
        assert!(validate_chunk_index(&index, 10).is_err());
    }

    #[test]
    fn chunk_index_rejects_overlap() {
        let index = vec![
            ChunkIndexEntry { start_id: 1, end_id: 6, cid: "a".into() },
            ChunkIndexEntry { start_id: 5, end_id: 10, cid: "b".into() },
        ];
        assert!(validate_chunk_index(&index, 10).is_err());
    }

    #[test]
    fn mutation_chunk_encrypt_decrypt_round_trip() {
        let (private, public) = generate_p256_keypair();
        let now = chrono::Utc::now();
        let mutation = Mutation::create_signed(
            1,
            "r-1",
            TargetType::Record,
            Operation::Delete,
            now,
            now,
            &public,
            &private,
        )
        .unwrap();
        let chunk = MutationChunk { mutations: vec![mutation] };
        let key = [5u8; 32];
        let ciphertext = chunk.encrypt(&key).unwrap();
        let decoded = MutationChunk::decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decoded, chunk);
    }
}
