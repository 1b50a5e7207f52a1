//! Device pairing handshake (spec.md §4.6): Initiator (A) and Joiner (B)
//! roles over a temp-keyed mutable name, confirmed by emoji fingerprint.

use chrono::Utc;
use rms_crypto::{
    fingerprint, generate_ed25519_keypair, generate_symmetric_key, Base64Bytes, Ed25519PublicKey,
    P256PublicKey,
};
use rms_proto::{
    DeviceManifest, DeviceRing, DeviceRingEntry, InviteScope, PairingSessionState, PendingInvite,
    PeerDirectory, PeerDirectoryPayload, QrPayload,
};
use rms_store::models::{PendingInviteRow, SyncMode};
use uuid::Uuid;

use crate::context::SyncContext;
use crate::device::{ensure_device_keys, ProviderConfig};
use crate::error::SyncError;
use crate::migration;

fn row_to_invite(row: &PendingInviteRow) -> Result<PendingInvite, SyncError> {
    Ok(PendingInvite {
        id: row.id.parse().map_err(|_| SyncError::Other("bad invite id".into()))?,
        scope: serde_json::from_str(&row.scope_json)?,
        state: parse_state(&row.state),
        temp_ipns_public_key: Base64Bytes::new(row.temp_ipns_public_key.clone()),
        temp_ipns_private_key: row.temp_ipns_private_key.clone().map(Base64Bytes::new),
        temp_symmetric_key: row.temp_symmetric_key.clone().map(Base64Bytes::new),
        peer_ipns_public_key: row.peer_ipns_public_key.clone().map(Base64Bytes::new),
        peer_auth_public_key: row.peer_auth_public_key.clone().map(Base64Bytes::new),
        peer_device_id: row.peer_device_id.clone(),
        created_at: row.created_at,
        expires_at: row.expires_at,
    })
}

fn parse_state(s: &str) -> PairingSessionState {
    match s {
        "scanned" => PairingSessionState::Scanned,
        "responded" => PairingSessionState::Responded,
        "verified" => PairingSessionState::Verified,
        "exchanging" => PairingSessionState::Exchanging,
        "completed" => PairingSessionState::Completed,
        "failed" => PairingSessionState::Failed,
        "expired" => PairingSessionState::Expired,
        _ => PairingSessionState::Created,
    }
}

fn state_str(s: PairingSessionState) -> &'static str {
    match s {
        PairingSessionState::Created => "created",
        PairingSessionState::Scanned => "scanned",
        PairingSessionState::Responded => "responded",
        PairingSessionState::Verified => "verified",
        PairingSessionState::Exchanging => "exchanging",
        PairingSessionState::Completed => "completed",
        PairingSessionState::Failed => "failed",
        PairingSessionState::Expired => "expired",
    }
}

/// Initiator (A) begins pairing: generates the ephemeral handshake
/// keypair, persists a `PendingInvite`, and returns the QR payload to
/// show the joiner (spec.md §4.6).
pub async fn initiate_pairing(
    ctx: &SyncContext,
    provider_cfg_to_share: Option<&ProviderConfig>,
) -> Result<(Uuid, QrPayload), SyncError> {
    ensure_device_keys(ctx).await?;
    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

    let (temp_priv, temp_pub) = generate_ed25519_keypair();
    let id = Uuid::new_v4();
    let now = Utc::now();
    let expires_at = now + chrono::Duration::milliseconds(ctx.config.sync.session_expiry_ms);

    let row = PendingInviteRow {
        id: id.to_string(),
        scope_json: serde_json::to_string(&InviteScope::DevicePairing)?,
        state: state_str(PairingSessionState::Created).to_string(),
        temp_ipns_public_key: temp_pub.to_bytes().to_vec(),
        temp_ipns_private_key: Some(temp_priv.to_bytes().to_vec()),
        temp_symmetric_key: None,
        peer_ipns_public_key: None,
        peer_auth_public_key: None,
        peer_device_id: None,
        created_at: now,
        expires_at,
    };
    ctx.store.insert_pending_invite(&row).await?;

    let provider_config = provider_cfg_to_share.map(serde_json::to_value).transpose()?;
    let qr = QrPayload::new(
        Base64Bytes::new(identity.ipns_public_key.to_bytes().to_vec()),
        Base64Bytes::new(identity.auth_public_key.to_bytes().to_vec()),
        Base64Bytes::new(temp_priv.to_bytes().to_vec()),
        provider_config,
    );
    Ok((id, qr))
}

/// Joiner (B) scans the QR payload, publishes its identity under the
/// temp mutable name, and returns its own emoji fingerprint (over its own
/// keys, per spec.md §4.6) for the user to compare against A's screen.
pub async fn join_pairing(ctx: &SyncContext, qr: &QrPayload) -> Result<[&'static str; 6], SyncError> {
    ensure_device_keys(ctx).await?;
    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

    let temp_priv = rms_crypto::Ed25519PrivateKey::from_bytes(qr.temp_ipns_private_key.as_slice())?;

    let response = rms_proto::PairingResponse::new(
        Base64Bytes::new(identity.ipns_public_key.to_bytes().to_vec()),
        Base64Bytes::new(identity.auth_public_key.to_bytes().to_vec()),
        identity.device_id.clone(),
    );
    let response_bytes = rms_crypto::to_canonical_bytes(&response)?;
    let cid = ctx.blob_store.upload(&response_bytes, None).await?.cid;
    ctx.blob_store.publish_name(&temp_priv, &cid, 1).await?;

    Ok(fingerprint(&identity.ipns_public_key.to_bytes(), &identity.auth_public_key.to_bytes()))
}

/// Initiator (A) polls the temp mutable name for the joiner's response
/// (2 s cadence, up to `maxPollAttempts`), returning the joiner's emoji
/// fingerprint (A's view, computed over B's keys) once found.
pub async fn poll_for_response(
    ctx: &SyncContext,
    invite_id: Uuid,
) -> Result<Option<[&'static str; 6]>, SyncError> {
    let row = ctx
        .store
        .get_pending_invite(&invite_id.to_string())
        .await?
        .ok_or(SyncError::Other("no such invite".into()))?;
    let invite = row_to_invite(&row)?;
    if invite.is_expired(Utc::now()) {
        ctx.store
            .update_pending_invite_state(&invite_id.to_string(), state_str(PairingSessionState::Expired), None, None, None)
            .await?;
        return Err(SyncError::SessionExpired);
    }

    let temp_ipns_public = Ed25519PublicKey::from_bytes(invite.temp_ipns_public_key.as_slice())?;
    let Some(cid) = ctx.blob_store.resolve_name(&temp_ipns_public).await? else {
        return Ok(None);
    };

    // The temp name resolved to something before we've fetched and
    // decoded it — B has scanned and published, even if the fetch below
    // turns out to be transient garbage.
    if invite.state == PairingSessionState::Created {
        ctx.store
            .update_pending_invite_state(&invite_id.to_string(), state_str(PairingSessionState::Scanned), None, None, None)
            .await?;
    }

    let bytes = ctx.blob_store.fetch(&cid).await?;
    let response: rms_proto::PairingResponse = serde_json::from_slice(&bytes)?;

    ctx.store
        .update_pending_invite_state(
            &invite_id.to_string(),
            state_str(PairingSessionState::Responded),
            Some(response.ipns_public_key.as_slice()),
            Some(response.auth_public_key.as_slice()),
            Some(&response.device_id),
        )
        .await?;

    let peer_ipns = response.ipns_public_key.as_slice();
    let peer_auth = response.auth_public_key.as_slice();
    Ok(Some(fingerprint(peer_ipns, peer_auth)))
}

/// Run the full poll loop (spec.md §6 `pollIntervalMs`/`maxPollAttempts`).
pub async fn poll_until_response(ctx: &SyncContext, invite_id: Uuid) -> Result<[&'static str; 6], SyncError> {
    for _ in 0..ctx.config.sync.max_poll_attempts {
        if let Some(fp) = poll_for_response(ctx, invite_id).await? {
            return Ok(fp);
        }
        tokio::time::sleep(std::time::Duration::from_millis(ctx.config.sync.poll_interval_ms)).await;
    }
    ctx.store
        .update_pending_invite_state(&invite_id.to_string(), state_str(PairingSessionState::Expired), None, None, None)
        .await?;
    Err(SyncError::SessionExpired)
}

/// A's confirmation step (spec.md §4.6): on the user confirming the
/// emoji match, A generates (or reuses) its `PersonalKey`/`BroadcastKey`,
/// runs migration if legacy data exists, and republishes a 2-device
/// DeviceRing/PeerDirectory/manifest at `sequence = prev + 1`.
pub async fn confirm_as_initiator(ctx: &SyncContext, invite_id: Uuid, emojis_matched: bool) -> Result<(), SyncError> {
    if !emojis_matched {
        ctx.store
            .update_pending_invite_state(&invite_id.to_string(), state_str(PairingSessionState::Failed), None, None, None)
            .await?;
        return Err(SyncError::EmojisRejected);
    }

    ctx.store
        .update_pending_invite_state(&invite_id.to_string(), state_str(PairingSessionState::Verified), None, None, None)
        .await?;

    let row = ctx
        .store
        .get_pending_invite(&invite_id.to_string())
        .await?
        .ok_or(SyncError::Other("no such invite".into()))?;
    let peer_auth_bytes = row.peer_auth_public_key.clone().ok_or(SyncError::Other("peer not responded yet".into()))?;
    let peer_ipns_bytes = row.peer_ipns_public_key.clone().ok_or(SyncError::Other("peer not responded yet".into()))?;
    let peer_device_id = row.peer_device_id.clone().ok_or(SyncError::Other("peer not responded yet".into()))?;

    let result: Result<(), SyncError> = async {
        ctx.store
            .update_pending_invite_state(&invite_id.to_string(), state_str(PairingSessionState::Exchanging), None, None, None)
            .await?;

        let existing = ctx.store.get_sync_config().await?;
        let (personal_key, broadcast_key) = match &existing {
            Some(cfg) if cfg.personal_key.is_some() && cfg.broadcast_key.is_some() => (
                cfg.personal_key.clone().unwrap().try_into().map_err(|_| SyncError::Other("bad key length".into()))?,
                cfg.broadcast_key.clone().unwrap().try_into().map_err(|_| SyncError::Other("bad key length".into()))?,
            ),
            _ => (generate_symmetric_key(), generate_symmetric_key()),
        };

        if ctx.store.legacy_users().await?.len() > 0 || ctx.store.legacy_records().await?.len() > 0 {
            migration::run_migration(ctx).await?;
        }

        let device_id = ctx.device_id().await?;
        let slot = ctx.device_slot();
        let guard = slot.read().await;
        let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

        let peer_auth_public = P256PublicKey::from_bytes(&peer_auth_bytes)?;
        let peer_ipns_public = Ed25519PublicKey::from_bytes(&peer_ipns_bytes)?;

        let ring = DeviceRing {
            devices: vec![
                DeviceRingEntry {
                    device_id: device_id.clone(),
                    auth_public_key: Base64Bytes::new(identity.auth_public_key.to_bytes().to_vec()),
                    ipns_public_key: Base64Bytes::new(identity.ipns_public_key.to_bytes().to_vec()),
                    last_synced_id: Some(0),
                },
                DeviceRingEntry {
                    device_id: peer_device_id.clone(),
                    auth_public_key: Base64Bytes::new(peer_auth_bytes.clone()),
                    ipns_public_key: Base64Bytes::new(peer_ipns_bytes.clone()),
                    last_synced_id: None,
                },
            ],
        };
        let ring_ciphertext = ring.encrypt(&broadcast_key)?;
        let device_ring_cid = ctx.blob_store.upload(&ring_ciphertext, None).await?.cid;

        let own_payload = PeerDirectoryPayload {
            personal_key: Some(Base64Bytes::new(personal_key.to_vec())),
            broadcast_key: Base64Bytes::new(broadcast_key.to_vec()),
            shared_groups: vec![],
        };
        let peer_payload = PeerDirectoryPayload {
            personal_key: Some(Base64Bytes::new(personal_key.to_vec())),
            broadcast_key: Base64Bytes::new(broadcast_key.to_vec()),
            shared_groups: vec![],
        };
        let directory = PeerDirectory::build(
            &identity.auth_private_key,
            &[(identity.auth_public_key.clone(), own_payload), (peer_auth_public.clone(), peer_payload)],
        )?;
        let directory_bytes = rms_crypto::to_canonical_bytes(&directory)?;
        let peer_directory_cid = ctx.blob_store.upload(&directory_bytes, None).await?.cid;

        let database_cid = ctx.blob_store.upload(b"{}", None).await?.cid;

        let manifest = DeviceManifest {
            database_cid,
            latest_mutation_id: DeviceManifest::encrypt_latest_mutation_id(&personal_key, 0)?,
            chunk_index: DeviceManifest::encrypt_chunk_index(&personal_key, &vec![])?,
            device_ring_cid,
            peer_directory_cid,
        };
        let manifest_bytes = rms_crypto::to_canonical_bytes(&manifest)?;
        let manifest_cid = ctx.blob_store.upload(&manifest_bytes, None).await?.cid;

        // Persist sync_config first so a device pairing straight from
        // NotConfigured (no prior setup_device/publish) has a row for
        // `next_publish_sequence` to advance.
        ctx.store
            .upsert_sync_config(SyncMode::Synced, Some(&personal_key), Some(&broadcast_key), None, Utc::now())
            .await?;
        let sequence = ctx.store.next_publish_sequence().await?;
        ctx.blob_store.publish_name(&identity.ipns_private_key, &manifest_cid, sequence).await?;
        drop(guard);

        ctx.store.upsert_peer_sync_state(&peer_device_id, &peer_ipns_public.to_bytes()).await?;

        ctx.store
            .update_pending_invite_state(&invite_id.to_string(), state_str(PairingSessionState::Completed), None, None, None)
            .await?;
        Ok(())
    }
    .await;

    if result.is_err() {
        let _ = ctx
            .store
            .update_pending_invite_state(&invite_id.to_string(), state_str(PairingSessionState::Failed), None, None, None)
            .await;
    }
    result
}

/// B's side of the exchange (spec.md §4.6): poll A's mutable name, fetch
/// the manifest, decrypt the owner-addressed `PeerDirectoryEntry` via
/// ECDH against A's auth key, adopt the symmetric keys, and republish
/// its own DeviceRing/PeerDirectory/database/manifest.
pub async fn complete_as_joiner(
    ctx: &SyncContext,
    a_ipns_public: &Ed25519PublicKey,
    a_auth_public: &P256PublicKey,
) -> Result<(), SyncError> {
    ensure_device_keys(ctx).await?;

    let mut manifest_cid = None;
    for _ in 0..ctx.config.sync.max_poll_attempts {
        if let Some(cid) = ctx.blob_store.resolve_name(a_ipns_public).await? {
            manifest_cid = Some(cid);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ctx.config.sync.poll_interval_ms)).await;
    }
    let manifest_cid = manifest_cid.ok_or(SyncError::SessionExpired)?;

    let manifest_bytes = ctx.blob_store.fetch(&manifest_cid).await?;
    let manifest: DeviceManifest = serde_json::from_slice(&manifest_bytes)?;
    let directory_bytes = ctx.blob_store.fetch(&manifest.peer_directory_cid).await?;
    let directory: PeerDirectory = serde_json::from_slice(&directory_bytes)?;

    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

    let payload = directory.decrypt_for(&identity.auth_private_key, &identity.auth_public_key, a_auth_public)?;
    let personal_key: [u8; 32] = payload
        .personal_key
        .ok_or(SyncError::Other("directory entry missing personal key".into()))?
        .as_slice()
        .try_into()
        .map_err(|_| SyncError::Other("bad personal key length".into()))?;
    let broadcast_key: [u8; 32] =
        payload.broadcast_key.as_slice().try_into().map_err(|_| SyncError::Other("bad broadcast key length".into()))?;

    if ctx.store.legacy_users().await?.len() > 0 || ctx.store.legacy_records().await?.len() > 0 {
        migration::run_migration(ctx).await?;
    }

    ctx.store
        .upsert_sync_config(SyncMode::Synced, Some(&personal_key), Some(&broadcast_key), None, Utc::now())
        .await?;

    let device_id = identity.device_id.clone();
    let ring = DeviceRing {
        devices: vec![DeviceRingEntry {
            device_id: device_id.clone(),
            auth_public_key: Base64Bytes::new(identity.auth_public_key.to_bytes().to_vec()),
            ipns_public_key: Base64Bytes::new(identity.ipns_public_key.to_bytes().to_vec()),
            last_synced_id: Some(0),
        }],
    };
    let ring_ciphertext = ring.encrypt(&broadcast_key)?;
    let device_ring_cid = ctx.blob_store.upload(&ring_ciphertext, None).await?.cid;

    let own_payload = PeerDirectoryPayload {
        personal_key: Some(Base64Bytes::new(personal_key.to_vec())),
        broadcast_key: Base64Bytes::new(broadcast_key.to_vec()),
        shared_groups: vec![],
    };
    let new_directory = PeerDirectory::build(&identity.auth_private_key, &[(identity.auth_public_key.clone(), own_payload)])?;
    let directory_bytes = rms_crypto::to_canonical_bytes(&new_directory)?;
    let peer_directory_cid = ctx.blob_store.upload(&directory_bytes, None).await?.cid;

    let database_cid = ctx.blob_store.upload(b"{}", None).await?.cid;
    let new_manifest = DeviceManifest {
        database_cid,
        latest_mutation_id: DeviceManifest::encrypt_latest_mutation_id(&personal_key, 0)?,
        chunk_index: DeviceManifest::encrypt_chunk_index(&personal_key, &vec![])?,
        device_ring_cid,
        peer_directory_cid,
    };
    let manifest_bytes = rms_crypto::to_canonical_bytes(&new_manifest)?;
    let own_manifest_cid = ctx.blob_store.upload(&manifest_bytes, None).await?.cid;
    let sequence = ctx.store.next_publish_sequence().await?;
    ctx.blob_store.publish_name(&identity.ipns_private_key, &own_manifest_cid, sequence).await?;

    Ok(())
}
