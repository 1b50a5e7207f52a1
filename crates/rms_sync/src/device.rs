//! Device setup & key store (spec.md §4.5).

use chrono::Utc;
use rms_crypto::{generate_ed25519_keypair, generate_p256_keypair, generate_symmetric_key, Base64Bytes};
use rms_proto::{DeviceManifest, DeviceRing, DeviceRingEntry, PeerDirectory, PeerDirectoryPayload};
use rms_store::models::SyncMode;
use serde::{Deserialize, Serialize};

use crate::context::{DeviceIdentity, SyncContext};
use crate::error::SyncError;

/// Abstract pinning-provider configuration (spec.md §1 treats the pinning
/// dialect as an external collaborator; this is the shape `setupDevice`
/// validates before trusting it for gateway selection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub gateway_urls: Vec<String>,
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), SyncError> {
        if self.gateway_urls.is_empty() {
            return Err(SyncError::ProviderInvalid("gateway_urls must not be empty".into()));
        }
        if self.gateway_urls.iter().any(|u| !u.starts_with("http://") && !u.starts_with("https://")) {
            return Err(SyncError::ProviderInvalid("gateway_urls must be http(s) URLs".into()));
        }
        Ok(())
    }
}

/// `ensureDeviceKeys()`: loads persistent device keys, generating them on
/// first run. Idempotent; safe to call from every entry point.
pub async fn ensure_device_keys(ctx: &SyncContext) -> Result<(), SyncError> {
    if ctx.device().await.is_some() {
        return Ok(());
    }

    let slot = ctx.device_slot();
    let mut guard = slot.write().await;
    if guard.is_some() {
        return Ok(());
    }

    if let Some(row) = ctx.store.get_own_device_keys().await? {
        let identity = DeviceIdentity {
            device_id: row.device_id,
            auth_private_key: rms_crypto::P256PrivateKey::from_bytes(&row.auth_private_key)?,
            auth_public_key: rms_crypto::P256PublicKey::from_bytes(&row.auth_public_key)?,
            ipns_private_key: rms_crypto::Ed25519PrivateKey::from_bytes(&row.ipns_private_key)?,
            ipns_public_key: rms_crypto::Ed25519PublicKey::from_bytes(&row.ipns_public_key)?,
        };
        *guard = Some(identity);
        return Ok(());
    }

    let (auth_private_key, auth_public_key) = generate_p256_keypair();
    let (ipns_private_key, ipns_public_key) = generate_ed25519_keypair();
    let device_id = rms_crypto::hash::derive_device_id(&auth_public_key.to_bytes());

    ctx.store
        .insert_device_keys(
            &device_id,
            &auth_private_key.to_bytes(),
            &auth_public_key.to_bytes(),
            &ipns_private_key.to_bytes(),
            &ipns_public_key.to_bytes(),
            Utc::now(),
        )
        .await?;

    tracing::info!(device_id = %device_id, "generated new device identity");
    *guard = Some(DeviceIdentity { device_id, auth_private_key, auth_public_key, ipns_private_key, ipns_public_key });
    Ok(())
}

/// Progress callback invoked after each ordered step of `setup_device`.
pub type ProgressFn<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// `setupDevice(providerCfg, selfName, onProgress)` (spec.md §4.5). Ordered
/// steps: ensure keys → validate provider → generate PersonalKey/
/// BroadcastKey → empty database → single-device DeviceRing → self-only
/// PeerDirectory → DeviceManifest → persist `mode=synced, migrated=true` →
/// publish mutable name at the next sequence (1, for a brand-new device).
///
/// Idempotent: if a manifest already exists for this device's mutable
/// name (i.e. `sync_config` already reports `Synced`), this is a no-op.
pub async fn setup_device(
    ctx: &SyncContext,
    provider_cfg: &ProviderConfig,
    _self_name: &str,
    on_progress: Option<&ProgressFn<'_>>,
) -> Result<(), SyncError> {
    let progress = |step: &str| {
        if let Some(f) = on_progress {
            f(step);
        }
    };

    progress("ensure_device_keys");
    ensure_device_keys(ctx).await?;

    if let Some(existing) = ctx.store.get_sync_config().await? {
        if SyncMode::parse(&existing.mode) == SyncMode::Synced {
            tracing::debug!("setup_device: already synced, skipping");
            return Ok(());
        }
    }

    progress("validate_provider");
    provider_cfg.validate()?;

    progress("generate_symmetric_keys");
    let personal_key = generate_symmetric_key();
    let broadcast_key = generate_symmetric_key();

    let device_id = ctx.device_id().await?;
    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

    progress("upload_empty_database");
    let database_cid = ctx.blob_store.upload(b"{}", None).await?.cid;

    progress("upload_device_ring");
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

    progress("upload_peer_directory");
    let payload = PeerDirectoryPayload {
        personal_key: Some(Base64Bytes::new(personal_key.to_vec())),
        broadcast_key: Base64Bytes::new(broadcast_key.to_vec()),
        shared_groups: vec![],
    };
    let directory = PeerDirectory::build(&identity.auth_private_key, &[(identity.auth_public_key.clone(), payload)])?;
    let directory_bytes = rms_crypto::to_canonical_bytes(&directory)?;
    let peer_directory_cid = ctx.blob_store.upload(&directory_bytes, None).await?.cid;

    progress("upload_device_manifest");
    let manifest = DeviceManifest {
        database_cid,
        latest_mutation_id: DeviceManifest::encrypt_latest_mutation_id(&personal_key, 0)?,
        chunk_index: DeviceManifest::encrypt_chunk_index(&personal_key, &vec![])?,
        device_ring_cid,
        peer_directory_cid,
    };
    let manifest_bytes = rms_crypto::to_canonical_bytes(&manifest)?;
    let manifest_cid = ctx.blob_store.upload(&manifest_bytes, None).await?.cid;

    // Persist the sync-config row before publishing so `next_publish_sequence`
    // has a row to advance — it starts at 0, so this first publish lands on 1.
    progress("persist_sync_config");
    ctx.store
        .upsert_sync_config(
            SyncMode::Synced,
            Some(&personal_key),
            Some(&broadcast_key),
            Some(&serde_json::to_string(provider_cfg)?),
            Utc::now(),
        )
        .await?;
    ctx.store.mark_migrated("", Utc::now()).await?;

    progress("publish_mutable_name");
    let sequence = ctx.store.next_publish_sequence().await?;
    ctx.blob_store.publish_name(&identity.ipns_private_key, &manifest_cid, sequence).await?;

    drop(guard);

    Ok(())
}

/// `not_configured | solo | synced`, chosen from presence of keys and
/// provider config (spec.md §4.5).
pub async fn sync_status(ctx: &SyncContext) -> Result<SyncMode, SyncError> {
    match ctx.store.get_sync_config().await? {
        Some(row) => Ok(SyncMode::parse(&row.mode)),
        None => Ok(if ctx.device().await.is_some() { SyncMode::Solo } else { SyncMode::NotConfigured }),
    }
}

/// `resetSyncConfig()` (spec.md §4.5, §5 "Resource policy"): zeroizes
/// in-memory device/symmetric key material and clears persisted sync
/// config. Idempotent.
pub async fn reset_sync_config(ctx: &SyncContext) -> Result<(), SyncError> {
    let slot = ctx.device_slot();
    let mut guard = slot.write().await;
    *guard = None; // drop zeroizes P256PrivateKey/Ed25519PrivateKey on drop
    drop(guard);

    ctx.store.reset_sync_config().await?;
    tracing::warn!("sync config reset, device keys cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use rms_blobstore::InMemoryBlobStore;
    use std::path::PathBuf;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn temp_ctx() -> SyncContext {
        let db_path = PathBuf::from(format!("/tmp/rms-sync-device-test-{}.db", Uuid::new_v4()));
        let store = rms_store::Store::open(&db_path).await.unwrap();
        let blob_store: Arc<dyn rms_blobstore::BlobStore> = Arc::new(InMemoryBlobStore::new());
        SyncContext::new(store, blob_store, EngineConfig::new(vec!["http://localhost:9000".into()]))
    }

    #[tokio::test]
    async fn ensure_device_keys_is_idempotent() {
        let ctx = temp_ctx().await;
        ensure_device_keys(&ctx).await.unwrap();
        let id1 = ctx.device_id().await.unwrap();
        ensure_device_keys(&ctx).await.unwrap();
        let id2 = ctx.device_id().await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn setup_device_rejects_empty_gateway_list() {
        let ctx = temp_ctx().await;
        let cfg = ProviderConfig { gateway_urls: vec![] };
        let err = setup_device(&ctx, &cfg, "alice", None).await.unwrap_err();
        assert!(matches!(err, SyncError::ProviderInvalid(_)));
    }

    #[tokio::test]
    async fn setup_device_persists_synced_mode() {
        let ctx = temp_ctx().await;
        let cfg = ProviderConfig { gateway_urls: vec!["http://localhost:9000".into()] };
        setup_device(&ctx, &cfg, "alice", None).await.unwrap();
        assert_eq!(sync_status(&ctx).await.unwrap(), SyncMode::Synced);
    }

    #[tokio::test]
    async fn reset_sync_config_clears_device_identity() {
        let ctx = temp_ctx().await;
        ensure_device_keys(&ctx).await.unwrap();
        reset_sync_config(&ctx).await.unwrap();
        assert!(ctx.device().await.is_none());
    }
}
