//! Publishing (spec.md §4.8): turn the pending mutation queue into an
//! encrypted chunk, update the owner's manifest, and advance the mutable
//! name. Runs under `SyncContext`'s process-wide publish guard.

use chrono::Utc;
use rms_proto::{
    ChunkIndex, ChunkIndexEntry, DeviceManifest, DeviceRing, DeviceRingEntry, Mutation, MutationChunk,
    PeerDirectory,
};
use rms_store::models::SyncMode;
use serde::Serialize;

use crate::context::SyncContext;
use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Default)]
pub struct PublishResult {
    pub count: usize,
}

/// Queue a freshly-signed mutation for the next publish (spec.md §6
/// `mutationQueue`).
pub async fn enqueue_mutation(ctx: &SyncContext, mutation: &Mutation) -> Result<(), SyncError> {
    let bytes = rms_crypto::to_canonical_bytes(mutation)?;
    let json = String::from_utf8(bytes).map_err(|e| SyncError::Other(e.to_string()))?;
    ctx.store.enqueue_mutation(mutation.id, &json, Utc::now()).await?;
    Ok(())
}

/// `publishPendingMutations()` (spec.md §4.8). Non-reentrant: a second
/// concurrent call returns `SyncError::PublishInProgress` immediately.
pub async fn publish_pending_mutations(ctx: &SyncContext) -> Result<PublishResult, SyncError> {
    let _guard = ctx.acquire_publish_guard()?;

    // Step 1: load pending queue.
    let pending = ctx.store.pending_mutations().await?;
    if pending.is_empty() {
        return Ok(PublishResult { count: 0 });
    }
    let mutations: Vec<Mutation> = pending
        .iter()
        .map(|row| serde_json::from_str::<Mutation>(&row.json))
        .collect::<Result<_, _>>()?;

    let sync_config = ctx.store.get_sync_config().await?.ok_or(SyncError::NotConfigured)?;
    if SyncMode::parse(&sync_config.mode) != SyncMode::Synced {
        return Err(SyncError::NotConfigured);
    }
    let personal_key: [u8; 32] = sync_config
        .personal_key
        .clone()
        .ok_or(SyncError::NotConfigured)?
        .try_into()
        .map_err(|_| SyncError::Other("bad personal key length".into()))?;
    let broadcast_key: [u8; 32] = sync_config
        .broadcast_key
        .clone()
        .ok_or(SyncError::NotConfigured)?
        .try_into()
        .map_err(|_| SyncError::Other("bad broadcast key length".into()))?;

    let device_id = ctx.device_id().await?;
    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

    // Step 2: resolve own current manifest, best-effort.
    let own_manifest = match ctx.blob_store.resolve_name(&identity.ipns_public_key).await {
        Ok(Some(cid)) => match ctx.blob_store.fetch(&cid).await {
            Ok(bytes) => serde_json::from_slice::<DeviceManifest>(&bytes).ok().map(|m| (cid, m)),
            Err(_) => None,
        },
        _ => None,
    };

    let (latest_mutation_id, mut chunk_index): (u64, ChunkIndex) = match &own_manifest {
        Some((_, manifest)) => {
            let latest = DeviceManifest::decrypt_latest_mutation_id(&personal_key, &manifest.latest_mutation_id)?;
            let index = DeviceManifest::decrypt_chunk_index(&personal_key, &manifest.chunk_index)?;
            (latest, index)
        }
        None => (0, Vec::new()),
    };

    // Step 3: build and upload one chunk covering the pending range.
    let start_id = latest_mutation_id + 1;
    let end_id = mutations.iter().map(|m| m.id).max().unwrap_or(start_id);
    let chunk = MutationChunk { mutations: mutations.clone() };
    let ciphertext = chunk.encrypt(&personal_key)?;
    let chunk_cid = ctx.blob_store.upload(&ciphertext, None).await?.cid;
    chunk_index.push(ChunkIndexEntry { start_id, end_id, cid: chunk_cid });

    // Step 4: upload an encrypted database snapshot. The domain database
    // itself is an external collaborator (spec.md §1); this crate only
    // owns the sync-layer state, so the snapshot is the empty state.
    let database_ciphertext = rms_crypto::aead::encrypt(&personal_key, b"{}", b"recordmoney-database-v1")?;
    let database_cid = ctx.blob_store.upload(&database_ciphertext, None).await?.cid;

    // Step 5: rebuild and upload the DeviceRing with this device's
    // lastSyncedId set to endId.
    let mut ring = match &own_manifest {
        Some((_, manifest)) => {
            let bytes = ctx.blob_store.fetch(&manifest.device_ring_cid).await?;
            DeviceRing::decrypt(&broadcast_key, &bytes).unwrap_or_default()
        }
        None => DeviceRing::default(),
    };
    if let Some(entry) = ring.devices.iter_mut().find(|d| d.device_id == device_id) {
        entry.last_synced_id = Some(end_id);
    } else {
        ring.devices.push(DeviceRingEntry {
            device_id: device_id.clone(),
            auth_public_key: rms_crypto::Base64Bytes::new(identity.auth_public_key.to_bytes().to_vec()),
            ipns_public_key: rms_crypto::Base64Bytes::new(identity.ipns_public_key.to_bytes().to_vec()),
            last_synced_id: Some(end_id),
        });
    }
    let ring_ciphertext = ring.encrypt(&broadcast_key)?;
    let device_ring_cid = ctx.blob_store.upload(&ring_ciphertext, None).await?.cid;

    // Step 6: rebuild and upload the PeerDirectory (unchanged membership
    // at publish time carries the existing directory forward verbatim).
    let peer_directory_cid = match &own_manifest {
        Some((_, manifest)) => {
            let bytes = ctx.blob_store.fetch(&manifest.peer_directory_cid).await?;
            let _ = serde_json::from_slice::<PeerDirectory>(&bytes)?; // validate shape
            ctx.blob_store.upload(&bytes, None).await?.cid
        }
        None => {
            let empty = PeerDirectory::default();
            let bytes = rms_crypto::to_canonical_bytes(&empty)?;
            ctx.blob_store.upload(&bytes, None).await?.cid
        }
    };

    // Step 7: build and upload the DeviceManifest.
    let manifest = DeviceManifest {
        database_cid,
        latest_mutation_id: DeviceManifest::encrypt_latest_mutation_id(&personal_key, end_id)?,
        chunk_index: DeviceManifest::encrypt_chunk_index(&personal_key, &chunk_index)?,
        device_ring_cid,
        peer_directory_cid,
    };
    let manifest_bytes = rms_crypto::to_canonical_bytes(&manifest)?;
    let manifest_cid = ctx.blob_store.upload(&manifest_bytes, None).await?.cid;

    // Step 8: publish the mutable name at the next sequence.
    let sequence = ctx.store.next_publish_sequence().await?;
    ctx.blob_store.publish_name(&identity.ipns_private_key, &manifest_cid, sequence).await?;
    drop(guard);

    // Step 9: mark the queue published; unpin the previous manifest CID
    // best-effort.
    let ids: Vec<u64> = mutations.iter().map(|m| m.id).collect();
    ctx.store.mark_published(&ids, Utc::now()).await?;
    if let Some((previous_cid, _)) = &own_manifest {
        if let Err(e) = ctx.blob_store.unpin(previous_cid).await {
            tracing::warn!(cid = %previous_cid, error = %e, "best-effort unpin of previous manifest failed");
        }
    }

    Ok(PublishResult { count: mutations.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::device::{setup_device, ProviderConfig};
    use rms_blobstore::InMemoryBlobStore;
    use rms_proto::{Operation, TargetType};
    use std::path::PathBuf;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn synced_ctx() -> SyncContext {
        let db_path = PathBuf::from(format!("/tmp/rms-sync-publish-test-{}.db", Uuid::new_v4()));
        let store = rms_store::Store::open(&db_path).await.unwrap();
        let blob_store: Arc<dyn rms_blobstore::BlobStore> = Arc::new(InMemoryBlobStore::new());
        let ctx = SyncContext::new(store, blob_store, EngineConfig::new(vec!["http://localhost:9000".into()]));
        let cfg = ProviderConfig { gateway_urls: vec!["http://localhost:9000".into()] };
        setup_device(&ctx, &cfg, "alice", None).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn publish_with_empty_queue_is_a_no_op() {
        let ctx = synced_ctx().await;
        let result = publish_pending_mutations(&ctx).await.unwrap();
        assert_eq!(result.count, 0);
    }

    #[tokio::test]
    async fn publish_advances_sequence_and_marks_published() {
        let ctx = synced_ctx().await;
        let slot = ctx.device_slot();
        let guard = slot.read().await;
        let identity = guard.as_ref().unwrap();
        let now = chrono::Utc::now();
        let id = ctx.store.next_mutation_id().await.unwrap();
        let mutation = Mutation::create_signed(
            id,
            "r-1",
            TargetType::Record,
            Operation::Delete,
            now,
            now,
            &identity.auth_public_key,
            &identity.auth_private_key,
        )
        .unwrap();
        drop(guard);
        enqueue_mutation(&ctx, &mutation).await.unwrap();

        let result = publish_pending_mutations(&ctx).await.unwrap();
        assert_eq!(result.count, 1);
        assert!(ctx.store.pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_publish_calls_are_rejected() {
        let ctx = synced_ctx().await;
        let _first = ctx.acquire_publish_guard().unwrap();
        let err = publish_pending_mutations(&ctx).await.unwrap_err();
        assert!(matches!(err, SyncError::PublishInProgress));
    }
}
