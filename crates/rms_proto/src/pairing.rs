//! QR payload and pairing-response wire formats (spec.md §4.6, §6).

use serde::{Deserialize, Serialize};

use rms_crypto::Base64Bytes;

pub const QR_PAYLOAD_VERSION: u32 = 1;

/// Scanned by the joiner. Carries everything needed to derive the
/// handshake's temp mutable name and, optionally, the initiator's storage
/// provider configuration so the joiner can adopt it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub version: u32,
    pub ipns_public_key: Base64Bytes,
    pub auth_public_key: Base64Bytes,
    pub temp_ipns_private_key: Base64Bytes,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider_config: Option<serde_json::Value>,
}

impl QrPayload {
    pub fn new(
        ipns_public_key: Base64Bytes,
        auth_public_key: Base64Bytes,
        temp_ipns_private_key: Base64Bytes,
        provider_config: Option<serde_json::Value>,
    ) -> Self {
        Self {
            version: QR_PAYLOAD_VERSION,
            ipns_public_key,
            auth_public_key,
            temp_ipns_private_key,
            provider_config,
        }
    }
}

/// Uploaded by the joiner (as bytes, under the temp mutable name) in plain
/// device pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub version: u32,
    pub ipns_public_key: Base64Bytes,
    pub auth_public_key: Base64Bytes,
    pub device_id: String,
}

impl PairingResponse {
    pub fn new(ipns_public_key: Base64Bytes, auth_public_key: Base64Bytes, device_id: impl Into<String>) -> Self {
        Self {
            version: QR_PAYLOAD_VERSION,
            ipns_public_key,
            auth_public_key,
            device_id: device_id.into(),
        }
    }
}

/// A group invite's handshake payload carries the same identity fields as
/// `QrPayload` plus the group name and a temp symmetric key used to seal
/// the invitee's response (spec.md §4.7: "same flow, group scope").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInvitePayload {
    pub version: u32,
    pub ipns_public_key: Base64Bytes,
    pub auth_public_key: Base64Bytes,
    pub temp_ipns_private_key: Base64Bytes,
    pub temp_symmetric_key: Base64Bytes,
    pub group_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_payload_round_trips() {
        let payload = QrPayload::new(
            Base64Bytes::new(vec![1u8; 32]),
            Base64Bytes::new(vec![2u8; 65]),
            Base64Bytes::new(vec![3u8; 32]),
            None,
        );
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"version\":1"));
        let back: QrPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
