//! Database row models — these map to/from SQL rows (spec.md §6
//! "Persisted local state").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceKeysRow {
    pub device_id: String,
    pub auth_private_key: Vec<u8>,
    pub auth_public_key: Vec<u8>,
    pub ipns_private_key: Vec<u8>,
    pub ipns_public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    NotConfigured,
    Solo,
    Synced,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::NotConfigured => "not_configured",
            SyncMode::Solo => "solo",
            SyncMode::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "solo" => SyncMode::Solo,
            "synced" => SyncMode::Synced,
            _ => SyncMode::NotConfigured,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncConfigRow {
    pub id: i64,
    pub mode: String,
    pub personal_key: Option<Vec<u8>>,
    pub broadcast_key: Option<Vec<u8>>,
    pub provider_config: Option<String>,
    pub migrated: bool,
    pub migrated_at: Option<DateTime<Utc>>,
    pub self_person_uuid: Option<String>,
    pub publish_sequence: i64,
    pub self_email: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationQueueStatus {
    Pending,
    Published,
}

impl MutationQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationQueueStatus::Pending => "pending",
            MutationQueueStatus::Published => "published",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MutationQueueRow {
    pub id: i64,
    pub status: String,
    /// Canonical JSON of the `rms_proto::Mutation`.
    pub json: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupKeysRow {
    pub group_uuid: String,
    pub group_key: Vec<u8>,
    pub rotated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PeerSyncStateRow {
    pub device_id: String,
    pub ipns_public_key: Vec<u8>,
    pub last_synced_id: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConflictRow {
    pub id: String,
    pub conflict_type: String,
    pub target_uuid: String,
    pub target_type: String,
    pub field: Option<String>,
    /// JSON array of `rms_proto::ConflictOption`.
    pub options_json: String,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingInviteRow {
    pub id: String,
    /// JSON of `rms_proto::InviteScope`.
    pub scope_json: String,
    pub state: String,
    pub temp_ipns_public_key: Vec<u8>,
    pub temp_ipns_private_key: Option<Vec<u8>>,
    pub temp_symmetric_key: Option<Vec<u8>>,
    pub peer_ipns_public_key: Option<Vec<u8>>,
    pub peer_auth_public_key: Option<Vec<u8>>,
    pub peer_device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CidHistoryRow {
    pub logical_key: String,
    pub current_cid: String,
    /// JSON array of up-to-`maxHistory` previous CIDs, newest first.
    pub previous_json: String,
}

// ── Legacy (C11 migration source) ────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LegacyUserRow {
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LegacyRecordRow {
    pub id: String,
    pub title: String,
    pub amount: i64,
    pub paid_by_email: String,
    /// JSON array of `{email, share}`.
    pub paid_for_json: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LegacyGroupRow {
    pub id: String,
    pub name: String,
    /// JSON array of member emails.
    pub member_emails_json: String,
}
