//! Conflict detection, resolution, malformed-content handling, and device
//! removal/self-wipe (spec.md §4.10).

use chrono::{DateTime, Utc};
use rms_proto::{
    Conflict, ConflictKind, ConflictOption, ConflictStatus, DeviceManifest, DeviceRing, FieldChange, Mutation,
    Operation, PeerDirectory, PeerDirectoryPayload, TargetType,
};
use rms_store::models::ConflictRow;
use serde_json::Value;
use uuid::Uuid;

use crate::context::SyncContext;
use crate::error::SyncError;

fn target_type_str(t: TargetType) -> &'static str {
    match t {
        TargetType::Record => "record",
        TargetType::Person => "person",
        TargetType::Group => "group",
        TargetType::Device => "device",
    }
}

fn parse_target_type(s: &str) -> Result<TargetType, SyncError> {
    match s {
        "record" => Ok(TargetType::Record),
        "person" => Ok(TargetType::Person),
        "group" => Ok(TargetType::Group),
        "device" => Ok(TargetType::Device),
        other => Err(SyncError::Other(format!("unknown target type {other}"))),
    }
}

fn conflict_kind_str(k: ConflictKind) -> &'static str {
    match k {
        ConflictKind::Field => "field",
        ConflictKind::Entity => "entity",
        ConflictKind::Merge => "merge",
    }
}

fn parse_conflict_kind(s: &str) -> Result<ConflictKind, SyncError> {
    match s {
        "field" => Ok(ConflictKind::Field),
        "entity" => Ok(ConflictKind::Entity),
        "merge" => Ok(ConflictKind::Merge),
        other => Err(SyncError::Other(format!("unknown conflict kind {other}"))),
    }
}

fn parse_status(s: &str) -> ConflictStatus {
    match s {
        "resolved" => ConflictStatus::Resolved,
        _ => ConflictStatus::Open,
    }
}

fn row_to_conflict(row: &ConflictRow) -> Result<Conflict, SyncError> {
    Ok(Conflict {
        id: row.id.parse().map_err(|_| SyncError::Other("bad conflict id".into()))?,
        kind: parse_conflict_kind(&row.conflict_type)?,
        target_uuid: row.target_uuid.clone(),
        target_type: parse_target_type(&row.target_type)?,
        field: row.field.clone(),
        options: serde_json::from_str(&row.options_json)?,
        status: parse_status(&row.status),
    })
}

/// One surviving finding from [`detect`]: either a field-level conflict
/// (same field, same `old`, diverging `new`) or an entity/merge-level one.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub kind: ConflictKind,
    pub field: Option<String>,
}

/// Compares a pending local mutation against a newly received one
/// targeting the same `(targetUuid, targetType)` and reports every
/// conflict spec.md §4.10 names. No conflict if the mutations are
/// disjoint, or if one's `old` matches the other's `new` (the pair is
/// causally ordered, not conflicting).
pub fn detect(local: &Mutation, incoming: &Mutation) -> Vec<DetectedConflict> {
    if local.target_uuid != incoming.target_uuid || local.target_type != incoming.target_type {
        return Vec::new();
    }

    match (&local.operation, &incoming.operation) {
        (Operation::Update { changes: local_changes }, Operation::Update { changes: incoming_changes }) => {
            let mut found = Vec::new();
            for lc in local_changes {
                let FieldChange::Scalar(ls) = lc else { continue };
                for ic in incoming_changes {
                    let FieldChange::Scalar(is_) = ic else { continue };
                    if ls.field != is_.field {
                        continue;
                    }
                    if ls.old == is_.new || is_.old == ls.new {
                        continue; // causal order established
                    }
                    if ls.old == is_.old && ls.new != is_.new {
                        found.push(DetectedConflict { kind: ConflictKind::Field, field: Some(ls.field.clone()) });
                    }
                }
            }
            found
        }
        (Operation::Delete, Operation::Update { .. }) | (Operation::Update { .. }, Operation::Delete) => {
            vec![DetectedConflict { kind: ConflictKind::Entity, field: None }]
        }
        (Operation::Merge { .. }, Operation::Update { .. }) | (Operation::Update { .. }, Operation::Merge { .. })
            if local.target_type == TargetType::Person =>
        {
            vec![DetectedConflict { kind: ConflictKind::Merge, field: None }]
        }
        _ => Vec::new(),
    }
}

fn option_from_mutation(mutation: &Mutation, field: Option<&str>) -> ConflictOption {
    let device_id = rms_crypto::hash::derive_device_id(mutation.author_device_public_key.as_slice());
    let value = match (&mutation.operation, field) {
        (Operation::Update { changes }, Some(f)) => changes
            .iter()
            .find_map(|c| match c {
                FieldChange::Scalar(sc) if sc.field == f => Some(sc.new.clone()),
                _ => None,
            })
            .unwrap_or(Value::Null),
        (op, _) => serde_json::to_value(op).unwrap_or(Value::Null),
    };
    ConflictOption { mutation_uuid: mutation.uuid, device_id, value, timestamp: mutation.signed_at }
}

/// Persists every [`DetectedConflict`] between `local` and `incoming`: a
/// fresh `Conflict` row if the target has no open one, or an appended
/// `ConflictOption` onto the existing one (spec.md §4.10 "For 3+ device
/// variants, new options can be appended").
pub async fn record_conflicts(
    ctx: &SyncContext,
    local: &Mutation,
    incoming: &Mutation,
    conflicts: &[DetectedConflict],
) -> Result<(), SyncError> {
    for detected in conflicts {
        let local_option = option_from_mutation(local, detected.field.as_deref());
        let incoming_option = option_from_mutation(incoming, detected.field.as_deref());

        match ctx.store.open_conflict_for_target(&local.target_uuid).await? {
            Some(row) => {
                let mut conflict = row_to_conflict(&row)?;
                conflict.append_option(incoming_option);
                ctx.store.update_conflict_options(&row.id, &serde_json::to_string(&conflict.options)?).await?;
            }
            None => {
                let conflict = Conflict {
                    id: Uuid::new_v4(),
                    kind: detected.kind,
                    target_uuid: local.target_uuid.clone(),
                    target_type: local.target_type,
                    field: detected.field.clone(),
                    options: vec![local_option, incoming_option],
                    status: ConflictStatus::Open,
                };
                let row = ConflictRow {
                    id: conflict.id.to_string(),
                    conflict_type: conflict_kind_str(conflict.kind).to_string(),
                    target_uuid: conflict.target_uuid.clone(),
                    target_type: target_type_str(conflict.target_type).to_string(),
                    field: conflict.field.clone(),
                    options_json: serde_json::to_string(&conflict.options)?,
                    status: "open".to_string(),
                };
                ctx.store.insert_conflict(&row).await?;
                tracing::info!(target = %conflict.target_uuid, kind = ?conflict.kind, "conflict recorded");
            }
        }
    }
    Ok(())
}

/// Applies the user's choice: enqueues a signed `resolve_conflict`
/// mutation naming the winner and voiding the rest, then marks the local
/// record resolved (spec.md §4.10 "Resolution"). `target_uuid` names the
/// conflicted entity (at most one open conflict per target, per
/// `Store::open_conflict_for_target`).
pub async fn resolve_conflict(
    ctx: &SyncContext,
    target_uuid: &str,
    winner_mutation_uuid: Uuid,
    summary: Option<String>,
) -> Result<(), SyncError> {
    let row = ctx
        .store
        .open_conflict_for_target(target_uuid)
        .await?
        .ok_or_else(|| SyncError::Other("no such open conflict".into()))?;
    let conflict = row_to_conflict(&row)?;

    let voided: Vec<Uuid> =
        conflict.options.iter().map(|o| o.mutation_uuid).filter(|id| *id != winner_mutation_uuid).collect();

    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;
    let id = ctx.store.next_mutation_id().await?;
    let now = Utc::now();
    let mutation = Mutation::create_signed(
        id,
        conflict.target_uuid.clone(),
        conflict.target_type,
        Operation::ResolveConflict {
            conflict_type: conflict.kind,
            winner_mutation_uuid,
            voided_mutation_uuids: voided,
            summary,
        },
        now,
        now,
        &identity.auth_public_key,
        &identity.auth_private_key,
    )?;
    drop(guard);

    crate::publish::enqueue_mutation(ctx, &mutation).await?;
    ctx.store.resolve_conflict(&row.id).await?;
    Ok(())
}

/// Malformed-content report, bounded to the last [`MAX_MALFORMED_REPORTS`]
/// entries per `SyncContext` (spec.md §4.10).
#[derive(Debug, Clone)]
pub struct MalformedReport {
    pub reason: String,
    pub mutation_uuid: Option<Uuid>,
    pub target_uuid: Option<String>,
    pub reported_at: DateTime<Utc>,
}

pub const MAX_MALFORMED_REPORTS: usize = 100;

/// Classifies a freshly-fetched mutation against spec.md §4.10's
/// malformed-content criteria. Structural errors (the chunk failed to
/// deserialize at all) are caught earlier, at chunk-decode time, and
/// never reach this function. Returns the reason the mutation is
/// malformed, or `None` if it's clean.
pub fn classify_malformed(mutation: &Mutation, now: DateTime<Utc>, known_device_ids: &[String]) -> Option<String> {
    if mutation.verify_signature().is_err() {
        return Some("invalid signature".to_string());
    }
    let author_device_id = rms_crypto::hash::derive_device_id(mutation.author_device_public_key.as_slice());
    if !known_device_ids.iter().any(|d| d == &author_device_id) {
        return Some(format!("unknown author device {author_device_id}"));
    }
    if mutation.is_malformed_by_age(now) {
        return Some("signedAt outside the 7 day malformed-content window".to_string());
    }
    None
}

/// Appends a bounded, in-memory malformed-content report and logs it.
/// Never propagates an error into the sync loop (spec.md §4.10).
pub fn report_malformed(ctx: &SyncContext, reason: impl Into<String>, mutation: Option<&Mutation>) {
    let report = MalformedReport {
        reason: reason.into(),
        mutation_uuid: mutation.map(|m| m.uuid),
        target_uuid: mutation.map(|m| m.target_uuid.clone()),
        reported_at: Utc::now(),
    };
    tracing::warn!(reason = %report.reason, target = ?report.target_uuid, "malformed mutation reported");
    ctx.record_malformed(report);
}

async fn sign_and_enqueue(
    ctx: &SyncContext,
    target_uuid: String,
    target_type: TargetType,
    operation: Operation,
) -> Result<(), SyncError> {
    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;
    let now = Utc::now();
    let id = ctx.store.next_mutation_id().await?;
    let mutation = Mutation::create_signed(
        id,
        target_uuid,
        target_type,
        operation,
        now,
        now,
        &identity.auth_public_key,
        &identity.auth_private_key,
    )?;
    drop(guard);
    crate::publish::enqueue_mutation(ctx, &mutation).await?;
    Ok(())
}

/// `removeDevice`: emit `delete` on `device:deviceId`, rotate both
/// `PersonalKey` and `BroadcastKey`, then republish a DeviceRing and
/// PeerDirectory covering only the remaining devices, and a fresh
/// DeviceManifest (spec.md §4.10 "Device removal"). Rotation is the
/// security guarantee the removed device cannot decrypt subsequent
/// personal/broadcast data; existing group memberships are unaffected
/// (group removal rotates the GroupKey instead, see `group::remove_member`).
pub async fn remove_device(ctx: &SyncContext, removed_device_id: &str) -> Result<(), SyncError> {
    let _guard = ctx.acquire_publish_guard()?;

    sign_and_enqueue(ctx, format!("device:{removed_device_id}"), TargetType::Device, Operation::Delete).await?;

    let sync_config = ctx.store.get_sync_config().await?.ok_or(SyncError::NotConfigured)?;
    let old_personal_key: [u8; 32] = sync_config
        .personal_key
        .clone()
        .ok_or(SyncError::NotConfigured)?
        .try_into()
        .map_err(|_| SyncError::Other("bad personal key length".into()))?;
    let old_broadcast_key: [u8; 32] = sync_config
        .broadcast_key
        .clone()
        .ok_or(SyncError::NotConfigured)?
        .try_into()
        .map_err(|_| SyncError::Other("bad broadcast key length".into()))?;

    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

    let manifest_cid = ctx
        .blob_store
        .resolve_name(&identity.ipns_public_key)
        .await?
        .ok_or_else(|| SyncError::Other("no existing manifest to republish from".into()))?;
    let manifest_bytes = ctx.blob_store.fetch(&manifest_cid).await?;
    let manifest: DeviceManifest = serde_json::from_slice(&manifest_bytes)?;

    let mut ring = {
        let bytes = ctx.blob_store.fetch(&manifest.device_ring_cid).await?;
        DeviceRing::decrypt(&old_broadcast_key, &bytes).unwrap_or_default()
    };
    ring.devices.retain(|d| d.device_id != removed_device_id);

    let new_personal_key = rms_crypto::generate_symmetric_key();
    let new_broadcast_key = rms_crypto::generate_symmetric_key();

    // Rebuild PeerDirectory for the remaining own devices only. Per-peer
    // SharedGroup entries from the old directory can't be recovered here
    // (they're sealed to each recipient's own key, not this device's), so
    // group memberships are left to be re-shared by the group service the
    // next time a group mutation touches them.
    let recipients: Vec<(rms_crypto::P256PublicKey, PeerDirectoryPayload)> = ring
        .devices
        .iter()
        .map(|d| {
            let pub_key = rms_crypto::P256PublicKey::from_bytes(d.auth_public_key.as_slice())?;
            Ok((
                pub_key,
                PeerDirectoryPayload {
                    personal_key: Some(rms_crypto::Base64Bytes::new(new_personal_key.to_vec())),
                    broadcast_key: rms_crypto::Base64Bytes::new(new_broadcast_key.to_vec()),
                    shared_groups: vec![],
                },
            ))
        })
        .collect::<Result<_, rms_crypto::CryptoError>>()?;
    let directory = PeerDirectory::build(&identity.auth_private_key, &recipients)?;
    let directory_bytes = rms_crypto::to_canonical_bytes(&directory)?;
    let peer_directory_cid = ctx.blob_store.upload(&directory_bytes, None).await?.cid;

    let ring_ciphertext = ring.encrypt(&new_broadcast_key)?;
    let device_ring_cid = ctx.blob_store.upload(&ring_ciphertext, None).await?.cid;

    let latest_mutation_id = DeviceManifest::decrypt_latest_mutation_id(&old_personal_key, &manifest.latest_mutation_id)?;
    let chunk_index = DeviceManifest::decrypt_chunk_index(&old_personal_key, &manifest.chunk_index)?;
    let database_ciphertext = rms_crypto::aead::encrypt(&new_personal_key, b"{}", b"recordmoney-database-v1")?;
    let database_cid = ctx.blob_store.upload(&database_ciphertext, None).await?.cid;

    let new_manifest = DeviceManifest {
        database_cid,
        latest_mutation_id: DeviceManifest::encrypt_latest_mutation_id(&new_personal_key, latest_mutation_id)?,
        chunk_index: DeviceManifest::encrypt_chunk_index(&new_personal_key, &chunk_index)?,
        device_ring_cid,
        peer_directory_cid,
    };
    let new_manifest_bytes = rms_crypto::to_canonical_bytes(&new_manifest)?;
    let new_manifest_cid = ctx.blob_store.upload(&new_manifest_bytes, None).await?.cid;

    let sequence = ctx.store.next_publish_sequence().await?;
    ctx.blob_store.publish_name(&identity.ipns_private_key, &new_manifest_cid, sequence).await?;
    drop(guard);

    ctx.store
        .upsert_sync_config(
            rms_store::models::SyncMode::Synced,
            Some(&new_personal_key),
            Some(&new_broadcast_key),
            sync_config.provider_config.as_deref(),
            Utc::now(),
        )
        .await?;

    if let Err(e) = ctx.blob_store.unpin(&manifest_cid).await {
        tracing::warn!(cid = %manifest_cid, error = %e, "best-effort unpin of pre-rotation manifest failed");
    }

    tracing::info!(removed_device_id, "device removed, PersonalKey/BroadcastKey rotated");
    Ok(())
}

/// Incoming `delete` on this device's own `device:deviceId` self-wipes
/// local sync state (spec.md §4.10). Returns `true` if a wipe happened.
pub async fn maybe_self_wipe(ctx: &SyncContext, mutation: &Mutation) -> Result<bool, SyncError> {
    if mutation.target_type != TargetType::Device || !matches!(mutation.operation, Operation::Delete) {
        return Ok(false);
    }
    let own_id = match ctx.device_id().await {
        Ok(id) => id,
        Err(_) => return Ok(false),
    };
    if mutation.target_uuid != format!("device:{own_id}") {
        return Ok(false);
    }
    crate::device::reset_sync_config(ctx).await?;
    tracing::warn!("received delete for own device id, local sync state wiped");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use rms_blobstore::InMemoryBlobStore;
    use rms_crypto::generate_p256_keypair;
    use rms_proto::ScalarChange;
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn temp_ctx() -> SyncContext {
        let db_path = PathBuf::from(format!("/tmp/rms-sync-conflict-test-{}.db", Uuid::new_v4()));
        let store = rms_store::Store::open(&db_path).await.unwrap();
        let blob_store: Arc<dyn rms_blobstore::BlobStore> = Arc::new(InMemoryBlobStore::new());
        let ctx = SyncContext::new(store, blob_store, EngineConfig::new(vec!["http://localhost:9000".into()]));
        crate::device::ensure_device_keys(&ctx).await.unwrap();
        ctx
    }

    fn update_mutation(target_uuid: &str, field: &str, old: Value, new: Value) -> Mutation {
        let (private, public) = generate_p256_keypair();
        let now = Utc::now();
        Mutation::create_signed(
            1,
            target_uuid,
            TargetType::Record,
            Operation::Update { changes: vec![FieldChange::Scalar(ScalarChange { field: field.into(), old, new })] },
            now,
            now,
            &public,
            &private,
        )
        .unwrap()
    }

    #[test]
    fn same_old_diverging_new_is_a_field_conflict() {
        let local = update_mutation("r-1", "amount", Value::from(100), Value::from(200));
        let incoming = update_mutation("r-1", "amount", Value::from(100), Value::from(300));
        let found = detect(&local, &incoming);
        assert_eq!(found, vec![DetectedConflict { kind: ConflictKind::Field, field: Some("amount".into()) }]);
    }

    #[test]
    fn causal_chain_is_not_a_conflict() {
        let local = update_mutation("r-1", "amount", Value::from(100), Value::from(200));
        let incoming = update_mutation("r-1", "amount", Value::from(200), Value::from(300));
        assert!(detect(&local, &incoming).is_empty());
    }

    #[test]
    fn disjoint_fields_do_not_conflict() {
        let local = update_mutation("r-1", "amount", Value::from(100), Value::from(200));
        let incoming = update_mutation("r-1", "title", Value::from("a"), Value::from("b"));
        assert!(detect(&local, &incoming).is_empty());
    }

    #[test]
    fn delete_vs_update_is_an_entity_conflict() {
        let (private, public) = generate_p256_keypair();
        let now = Utc::now();
        let delete = Mutation::create_signed(1, "r-1", TargetType::Record, Operation::Delete, now, now, &public, &private).unwrap();
        let update = update_mutation("r-1", "amount", Value::from(100), Value::from(200));
        assert_eq!(detect(&delete, &update), vec![DetectedConflict { kind: ConflictKind::Entity, field: None }]);
    }

    #[test]
    fn stale_signed_at_is_malformed() {
        let (private, public) = generate_p256_keypair();
        let old = Utc::now() - chrono::Duration::days(8);
        let mutation = Mutation::create_signed(1, "r-1", TargetType::Record, Operation::Delete, old, old, &public, &private).unwrap();
        let device_id = rms_crypto::hash::derive_device_id(mutation.author_device_public_key.as_slice());
        let reason = classify_malformed(&mutation, Utc::now(), &[device_id]);
        assert!(reason.is_some());
    }

    #[test]
    fn unknown_author_is_malformed() {
        let (private, public) = generate_p256_keypair();
        let now = Utc::now();
        let mutation = Mutation::create_signed(1, "r-1", TargetType::Record, Operation::Delete, now, now, &public, &private).unwrap();
        let reason = classify_malformed(&mutation, now, &[]);
        assert!(reason.is_some());
    }

    #[tokio::test]
    async fn self_wipe_clears_sync_config_on_own_device_delete() {
        let ctx = temp_ctx().await;
        let device_id = ctx.device_id().await.unwrap();
        let (private, public) = generate_p256_keypair();
        let now = Utc::now();
        let mutation = Mutation::create_signed(
            1,
            format!("device:{device_id}"),
            TargetType::Device,
            Operation::Delete,
            now,
            now,
            &public,
            &private,
        )
        .unwrap();
        assert!(maybe_self_wipe(&ctx, &mutation).await.unwrap());
        assert!(ctx.device().await.is_none());
    }

    #[tokio::test]
    async fn malformed_report_log_is_bounded() {
        let ctx = temp_ctx().await;
        for i in 0..(MAX_MALFORMED_REPORTS + 10) {
            report_malformed(&ctx, format!("reason {i}"), None);
        }
        assert_eq!(ctx.malformed_reports().len(), MAX_MALFORMED_REPORTS);
    }

    #[tokio::test]
    async fn resolve_conflict_voids_the_losing_option_and_closes_the_conflict() {
        let ctx = temp_ctx().await;
        let local = update_mutation("r-1", "amount", Value::from(100), Value::from(200));
        let incoming = update_mutation("r-1", "amount", Value::from(100), Value::from(300));
        let found = detect(&local, &incoming);
        record_conflicts(&ctx, &local, &incoming, &found).await.unwrap();

        resolve_conflict(&ctx, "r-1", incoming.uuid, Some("picked the newer value".into())).await.unwrap();

        assert!(ctx.store.open_conflict_for_target("r-1").await.unwrap().is_none());
        let pending = ctx.store.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].json.contains("resolve_conflict"));
    }
}
