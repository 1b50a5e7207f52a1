//! Database abstraction over SQLite via sqlx — the concrete `LocalStore`
//! (spec.md §1 treats this as an abstract collaborator; this crate is the
//! one real implementation of it) backing `deviceKeys`, `syncConfig`,
//! `mutationQueue`, `groupKeys`, `peerSyncStates`, `conflicts`,
//! `pendingInvites`, `cidHistory`, and the legacy tables C11 reads from.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    Row,
};

use crate::error::StoreError;
use crate::models::{
    CidHistoryRow, ConflictRow, DeviceKeysRow, GroupKeysRow, LegacyGroupRow, LegacyRecordRow,
    LegacyUserRow, MutationQueueRow, PeerSyncStateRow, PendingInviteRow, SyncConfigRow, SyncMode,
};

/// Central store handle. Cheap to clone (the pool is reference-counted
/// internally).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path`, running all
    /// pending migrations.
    ///
    /// WAL journal mode is set at connection time, not inside a migration:
    /// SQLite forbids changing `journal_mode` inside a transaction and
    /// sqlx wraps every migration in one.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::debug!(path = %db_path.display(), "opened local store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── deviceKeys ────────────────────────────────────────────────────────────

    pub async fn get_device_keys(&self, device_id: &str) -> Result<Option<DeviceKeysRow>, StoreError> {
        let row = sqlx::query_as::<_, DeviceKeysRow>(
            "SELECT device_id, auth_private_key, auth_public_key, ipns_private_key, ipns_public_key, created_at \
             FROM device_keys WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// There is exactly one local device identity; this returns the sole
    /// row if one has ever been generated.
    pub async fn get_own_device_keys(&self) -> Result<Option<DeviceKeysRow>, StoreError> {
        let row = sqlx::query_as::<_, DeviceKeysRow>(
            "SELECT device_id, auth_private_key, auth_public_key, ipns_private_key, ipns_public_key, created_at \
             FROM device_keys ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert_device_keys(
        &self,
        device_id: &str,
        auth_private_key: &[u8],
        auth_public_key: &[u8],
        ipns_private_key: &[u8],
        ipns_public_key: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO device_keys (device_id, auth_private_key, auth_public_key, ipns_private_key, ipns_public_key, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(device_id)
        .bind(auth_private_key)
        .bind(auth_public_key)
        .bind(ipns_private_key)
        .bind(ipns_public_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── syncConfig (singleton) ───────────────────────────────────────────────

    pub async fn get_sync_config(&self) -> Result<Option<SyncConfigRow>, StoreError> {
        let row = sqlx::query_as::<_, SyncConfigRow>(
            "SELECT id, mode, personal_key, broadcast_key, provider_config, migrated, migrated_at, self_person_uuid, \
             publish_sequence, self_email, updated_at FROM sync_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Records the legacy self-identifying email the C11 migration
    /// compares against `legacy_users.email` (spec.md §4.11). Must be set
    /// before `run_migration` for `isSelf` to resolve correctly; a row is
    /// created if none exists yet.
    pub async fn set_self_email(&self, email: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_config (id, self_email, updated_at) VALUES (1, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET self_email = excluded.self_email, updated_at = excluded.updated_at",
        )
        .bind(email)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically increments and returns the next mutable-name publish
    /// sequence for this device's own manifest (spec.md §4.8 step 8).
    pub async fn next_publish_sequence(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE sync_config SET publish_sequence = publish_sequence + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("SELECT publish_sequence FROM sync_config WHERE id = 1").fetch_one(&mut *tx).await?;
        let sequence: i64 = row.try_get("publish_sequence")?;
        tx.commit().await?;
        Ok(sequence as u64)
    }

    pub async fn upsert_sync_config(
        &self,
        mode: SyncMode,
        personal_key: Option<&[u8]>,
        broadcast_key: Option<&[u8]>,
        provider_config: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_config (id, mode, personal_key, broadcast_key, provider_config, updated_at) \
             VALUES (1, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET mode = excluded.mode, personal_key = excluded.personal_key, \
             broadcast_key = excluded.broadcast_key, provider_config = excluded.provider_config, updated_at = excluded.updated_at",
        )
        .bind(mode.as_str())
        .bind(personal_key)
        .bind(broadcast_key)
        .bind(provider_config)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persists `{migrated, migratedAt, selfPersonUuid}` (spec.md §4.11).
    pub async fn mark_migrated(&self, self_person_uuid: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_config SET migrated = 1, migrated_at = ?, self_person_uuid = ?, updated_at = ? WHERE id = 1",
        )
        .bind(now)
        .bind(self_person_uuid)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `reset_sync_config` (spec.md §4.5, §5): clears the singleton row.
    /// Callers are responsible for zeroizing the in-memory key material
    /// they read out before calling this.
    pub async fn reset_sync_config(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_config WHERE id = 1").execute(&self.pool).await?;
        sqlx::query("DELETE FROM device_keys").execute(&self.pool).await?;
        tracing::warn!("sync config and device keys reset");
        Ok(())
    }

    // ── mutationQueue ─────────────────────────────────────────────────────────

    /// The next per-device monotonic mutation id (spec.md §3 invariant:
    /// within one device, `id` strictly increases).
    pub async fn next_mutation_id(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS max_id FROM mutation_queue")
            .fetch_one(&self.pool)
            .await?;
        let max_id: i64 = row.try_get("max_id")?;
        Ok(max_id as u64 + 1)
    }

    pub async fn enqueue_mutation(&self, id: u64, json: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO mutation_queue (id, status, json, created_at) VALUES (?, 'pending', ?, ?)")
            .bind(id as i64)
            .bind(json)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn pending_mutations(&self) -> Result<Vec<MutationQueueRow>, StoreError> {
        let rows = sqlx::query_as::<_, MutationQueueRow>(
            "SELECT id, status, json, created_at, published_at FROM mutation_queue WHERE status = 'pending' ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Atomic with respect to concurrent enqueues (spec.md §5): a single
    /// `UPDATE ... WHERE id IN (...)` statement.
    pub async fn mark_published(&self, ids: &[u64], now: DateTime<Utc>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE mutation_queue SET status = 'published', published_at = ? WHERE id = ?")
                .bind(now)
                .bind(*id as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ── groupKeys ─────────────────────────────────────────────────────────────

    pub async fn get_group_key(&self, group_uuid: &str) -> Result<Option<GroupKeysRow>, StoreError> {
        let row = sqlx::query_as::<_, GroupKeysRow>(
            "SELECT group_uuid, group_key, rotated_at FROM group_keys WHERE group_uuid = ?",
        )
        .bind(group_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_group_key(&self, group_uuid: &str, group_key: &[u8], now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO group_keys (group_uuid, group_key, rotated_at) VALUES (?, ?, ?) \
             ON CONFLICT(group_uuid) DO UPDATE SET group_key = excluded.group_key, rotated_at = excluded.rotated_at",
        )
        .bind(group_uuid)
        .bind(group_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── peerSyncStates ────────────────────────────────────────────────────────

    pub async fn all_peer_sync_states(&self) -> Result<Vec<PeerSyncStateRow>, StoreError> {
        let rows = sqlx::query_as::<_, PeerSyncStateRow>(
            "SELECT device_id, ipns_public_key, last_synced_id, last_synced_at, last_attempted_at, consecutive_failures \
             FROM peer_sync_states",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_peer_sync_state(&self, device_id: &str, ipns_public_key: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO peer_sync_states (device_id, ipns_public_key, last_synced_id, consecutive_failures) \
             VALUES (?, ?, 0, 0) ON CONFLICT(device_id) DO NOTHING",
        )
        .bind(device_id)
        .bind(ipns_public_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_peer_sync_state(&self, device_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM peer_sync_states WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_peer_sync_success(&self, device_id: &str, last_synced_id: u64, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE peer_sync_states SET last_synced_id = ?, last_synced_at = ?, last_attempted_at = ?, consecutive_failures = 0 \
             WHERE device_id = ?",
        )
        .bind(last_synced_id as i64)
        .bind(now)
        .bind(now)
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_peer_sync_failure(&self, device_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE peer_sync_states SET last_attempted_at = ?, consecutive_failures = consecutive_failures + 1 WHERE device_id = ?",
        )
        .bind(now)
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── conflicts ─────────────────────────────────────────────────────────────

    pub async fn insert_conflict(&self, row: &ConflictRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conflicts (id, conflict_type, target_uuid, target_type, field, options_json, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.conflict_type)
        .bind(&row.target_uuid)
        .bind(&row.target_type)
        .bind(&row.field)
        .bind(&row.options_json)
        .bind(&row.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_conflict_options(&self, id: &str, options_json: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE conflicts SET options_json = ? WHERE id = ?")
            .bind(options_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn resolve_conflict(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE conflicts SET status = 'resolved' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn open_conflict_for_target(&self, target_uuid: &str) -> Result<Option<ConflictRow>, StoreError> {
        let row = sqlx::query_as::<_, ConflictRow>(
            "SELECT id, conflict_type, target_uuid, target_type, field, options_json, status \
             FROM conflicts WHERE target_uuid = ? AND status = 'open' LIMIT 1",
        )
        .bind(target_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ── pendingInvites ────────────────────────────────────────────────────────

    pub async fn insert_pending_invite(&self, row: &PendingInviteRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pending_invites (id, scope_json, state, temp_ipns_public_key, temp_ipns_private_key, \
             temp_symmetric_key, peer_ipns_public_key, peer_auth_public_key, peer_device_id, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.scope_json)
        .bind(&row.state)
        .bind(&row.temp_ipns_public_key)
        .bind(&row.temp_ipns_private_key)
        .bind(&row.temp_symmetric_key)
        .bind(&row.peer_ipns_public_key)
        .bind(&row.peer_auth_public_key)
        .bind(&row.peer_device_id)
        .bind(row.created_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pending_invite(&self, id: &str) -> Result<Option<PendingInviteRow>, StoreError> {
        let row = sqlx::query_as::<_, PendingInviteRow>(
            "SELECT id, scope_json, state, temp_ipns_public_key, temp_ipns_private_key, temp_symmetric_key, \
             peer_ipns_public_key, peer_auth_public_key, peer_device_id, created_at, expires_at \
             FROM pending_invites WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_pending_invite_state(
        &self,
        id: &str,
        state: &str,
        peer_ipns_public_key: Option<&[u8]>,
        peer_auth_public_key: Option<&[u8]>,
        peer_device_id: Option<&str>,
    ) -> Result<(), StoreError> {
        // `COALESCE` so a status-only transition (peer fields all `None`)
        // doesn't clobber peer identity recorded by an earlier transition.
        sqlx::query(
            "UPDATE pending_invites SET state = ?, \
             peer_ipns_public_key = COALESCE(?, peer_ipns_public_key), \
             peer_auth_public_key = COALESCE(?, peer_auth_public_key), \
             peer_device_id = COALESCE(?, peer_device_id) \
             WHERE id = ?",
        )
        .bind(state)
        .bind(peer_ipns_public_key)
        .bind(peer_auth_public_key)
        .bind(peer_device_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── cidHistory ────────────────────────────────────────────────────────────

    pub async fn get_cid_history(&self, logical_key: &str) -> Result<Option<CidHistoryRow>, StoreError> {
        let row = sqlx::query_as::<_, CidHistoryRow>(
            "SELECT logical_key, current_cid, previous_json FROM cid_history WHERE logical_key = ?",
        )
        .bind(logical_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_cid_history(&self, logical_key: &str, current_cid: &str, previous_json: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cid_history (logical_key, current_cid, previous_json) VALUES (?, ?, ?) \
             ON CONFLICT(logical_key) DO UPDATE SET current_cid = excluded.current_cid, previous_json = excluded.previous_json",
        )
        .bind(logical_key)
        .bind(current_cid)
        .bind(previous_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── legacy (C11 migration source) ────────────────────────────────────────
    //
    // These tables are populated by whatever pre-sync schema the host
    // application already has (out of scope here); the insert helpers
    // below exist so migration can be seeded and exercised in tests.

    pub async fn insert_legacy_user(&self, row: &LegacyUserRow) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO legacy_users (email, display_name) VALUES (?, ?)")
            .bind(&row.email)
            .bind(&row.display_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_legacy_record(&self, row: &LegacyRecordRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO legacy_records (id, title, amount, paid_by_email, paid_for_json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.title)
        .bind(row.amount)
        .bind(&row.paid_by_email)
        .bind(&row.paid_for_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_legacy_group(&self, row: &LegacyGroupRow) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO legacy_groups (id, name, member_emails_json) VALUES (?, ?, ?)")
            .bind(&row.id)
            .bind(&row.name)
            .bind(&row.member_emails_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn legacy_users(&self) -> Result<Vec<LegacyUserRow>, StoreError> {
        let rows = sqlx::query_as::<_, LegacyUserRow>("SELECT email, display_name FROM legacy_users")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn legacy_records(&self) -> Result<Vec<LegacyRecordRow>, StoreError> {
        let rows = sqlx::query_as::<_, LegacyRecordRow>(
            "SELECT id, title, amount, paid_by_email, paid_for_json FROM legacy_records",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn legacy_groups(&self) -> Result<Vec<LegacyGroupRow>, StoreError> {
        let rows = sqlx::query_as::<_, LegacyGroupRow>("SELECT id, name, member_emails_json FROM legacy_groups")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn temp_store() -> (Store, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/rms-store-test-{}.db", Uuid::new_v4()));
        let store = Store::open(&db_path).await.expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: &Path) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn mutation_queue_ids_are_monotonic() {
        let (store, db_path) = temp_store().await;
        let now = Utc::now();
        assert_eq!(store.next_mutation_id().await.unwrap(), 1);
        store.enqueue_mutation(1, "{}", now).await.unwrap();
        assert_eq!(store.next_mutation_id().await.unwrap(), 2);
        store.enqueue_mutation(2, "{}", now).await.unwrap();

        let pending = store.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 2);

        store.mark_published(&[1, 2], now).await.unwrap();
        assert!(store.pending_mutations().await.unwrap().is_empty());

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn sync_config_upsert_then_reset() {
        let (store, db_path) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_sync_config(SyncMode::Synced, Some(&[1u8; 32]), Some(&[2u8; 32]), None, now)
            .await
            .unwrap();
        let cfg = store.get_sync_config().await.unwrap().unwrap();
        assert_eq!(cfg.mode, "synced");

        store.reset_sync_config().await.unwrap();
        assert!(store.get_sync_config().await.unwrap().is_none());

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn peer_sync_state_tracks_failures_and_resets_on_success() {
        let (store, db_path) = temp_store().await;
        let now = Utc::now();
        store.upsert_peer_sync_state("d1", &[1u8; 32]).await.unwrap();
        store.record_peer_sync_failure("d1", now).await.unwrap();
        store.record_peer_sync_failure("d1", now).await.unwrap();

        let states = store.all_peer_sync_states().await.unwrap();
        assert_eq!(states[0].consecutive_failures, 2);

        store.record_peer_sync_success("d1", 10, now).await.unwrap();
        let states = store.all_peer_sync_states().await.unwrap();
        assert_eq!(states[0].consecutive_failures, 0);
        assert_eq!(states[0].last_synced_id, 10);

        cleanup(&db_path);
    }
}
