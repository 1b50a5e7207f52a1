//! Group lifecycle wire types: invites, membership, conflicts (spec.md §3,
//! §4.6, §4.7, §4.10).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rms_crypto::Base64Bytes;

/// The distinguished self-only group every device creates during setup
/// (spec.md §4.7). Cannot be exited.
pub const PERSONAL_LEDGER_GROUP_NAME: &str = "Personal Ledger";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    pub members: Vec<Uuid>,
    pub is_personal_ledger: bool,
}

impl Group {
    pub fn new_personal_ledger(owner_person_uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: PERSONAL_LEDGER_GROUP_NAME.to_string(),
            members: vec![owner_person_uuid],
            is_personal_ledger: true,
        }
    }

    pub fn new(name: impl Into<String>, owner_person_uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            members: vec![owner_person_uuid],
            is_personal_ledger: false,
        }
    }
}

// ── Pairing / invite session state machine (spec.md §4.6, §4.7, §6) ─────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingSessionState {
    Created,
    Scanned,
    Responded,
    Verified,
    Exchanging,
    Completed,
    Failed,
    Expired,
}

/// Which flow a `PendingInvite` row is tracking: a raw device pairing
/// (§4.6) or a group invite (§4.7, "same flow, group scope").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InviteScope {
    DevicePairing,
    GroupInvite { group_uuid: Uuid, group_name: String },
}

/// `PendingInvite` — persisted state machine for both device pairing and
/// group invites (spec.md §3, §6 `pendingInvites` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInvite {
    pub id: Uuid,
    pub scope: InviteScope,
    pub state: PairingSessionState,
    /// Ephemeral Ed25519 public key this invite's mutable name is published
    /// under.
    pub temp_ipns_public_key: Base64Bytes,
    /// Ephemeral Ed25519 private key — only held by the side that generated
    /// it (initiator for pairing, inviter for group invites).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temp_ipns_private_key: Option<Base64Bytes>,
    /// Ephemeral symmetric key used to seal a group invite response
    /// (`None` for plain device pairing, which uses ECDH instead).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temp_symmetric_key: Option<Base64Bytes>,
    /// Peer's identity keys, known once the handshake response is fetched.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peer_ipns_public_key: Option<Base64Bytes>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peer_auth_public_key: Option<Base64Bytes>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peer_device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingInvite {
    /// Session expiry is `sessionExpiryMs` (default 600_000 ms / 10 min)
    /// after creation (spec.md §4.6, §6). `now == expires_at - 1ms` is
    /// still valid; `expires_at + 1ms` is expired (spec.md §8 boundary).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ── Conflicts (spec.md §3, §4.10) ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictOption {
    pub mutation_uuid: Uuid,
    pub device_id: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Locally stored conflict record (spec.md §3 "Conflict"). Binary (two
/// options) or N-ary (3+ device variants can append options before
/// resolution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: crate::mutation::ConflictKind,
    pub target_uuid: String,
    pub target_type: crate::mutation::TargetType,
    /// Present for field conflicts, absent for entity/merge conflicts.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub field: Option<String>,
    pub options: Vec<ConflictOption>,
    pub status: ConflictStatus,
}

impl Conflict {
    pub fn append_option(&mut self, option: ConflictOption) {
        if !self.options.iter().any(|o| o.mutation_uuid == option.mutation_uuid) {
            self.options.push(option);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_invite_expiry_boundary() {
        let now = Utc::now();
        let invite = PendingInvite {
            id: Uuid::new_v4(),
            scope: InviteScope::DevicePairing,
            state: PairingSessionState::Created,
            temp_ipns_public_key: Base64Bytes::new(vec![1u8; 32]),
            temp_ipns_private_key: Some(Base64Bytes::new(vec![2u8; 32])),
            temp_symmetric_key: None,
            peer_ipns_public_key: None,
            peer_auth_public_key: None,
            peer_device_id: None,
            created_at: now,
            expires_at: now + chrono::Duration::milliseconds(600_000),
        };
        assert!(!invite.is_expired(invite.expires_at - chrono::Duration::milliseconds(1)));
        assert!(invite.is_expired(invite.expires_at + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn conflict_append_option_deduplicates() {
        let mut conflict = Conflict {
            id: Uuid::new_v4(),
            kind: crate::mutation::ConflictKind::Field,
            target_uuid: "r-1".into(),
            target_type: crate::mutation::TargetType::Record,
            field: Some("amount".into()),
            options: vec![],
            status: ConflictStatus::Open,
        };
        let option = ConflictOption {
            mutation_uuid: Uuid::new_v4(),
            device_id: "d1".into(),
            value: serde_json::json!(200),
            timestamp: Utc::now(),
        };
        conflict.append_option(option.clone());
        conflict.append_option(option);
        assert_eq!(conflict.options.len(), 1);
    }
}
