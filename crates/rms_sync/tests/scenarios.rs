//! Cross-device integration tests for spec.md §8's concrete scenarios,
//! driving the public `rms_sync` API the way two real devices would
//! rather than calling module-internal helpers directly.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rms_blobstore::{BlobStore, InMemoryBlobStore};
use rms_proto::{Mutation, Operation, TargetType};
use rms_sync::config::EngineConfig;
use rms_sync::context::SyncContext;
use rms_sync::engine::SyncEngine;
use rms_sync::publish::enqueue_mutation;
use uuid::Uuid;

async fn fresh_ctx(label: &str, blob_store: Arc<dyn BlobStore>) -> SyncContext {
    let db_path = PathBuf::from(format!("/tmp/rms-sync-scenario-{label}-{}.db", Uuid::new_v4()));
    let store = rms_store::Store::open(&db_path).await.unwrap();
    SyncContext::new(store, blob_store, EngineConfig::new(vec!["http://localhost:9000".into()]))
}

/// Two devices, one shared in-memory blob store standing in for the
/// pinning network both would otherwise reach over HTTP.
async fn pair_two_devices() -> (SyncContext, SyncContext) {
    let blob_store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let ctx_a = fresh_ctx("a", blob_store.clone()).await;
    let ctx_b = fresh_ctx("b", blob_store.clone()).await;

    rms_sync::device::ensure_device_keys(&ctx_a).await.unwrap();
    rms_sync::device::ensure_device_keys(&ctx_b).await.unwrap();

    let (invite_id, qr) = rms_sync::pairing::initiate_pairing(&ctx_a, None).await.unwrap();
    let b_fingerprint = rms_sync::pairing::join_pairing(&ctx_b, &qr).await.unwrap();
    let a_fingerprint = rms_sync::pairing::poll_until_response(&ctx_a, invite_id).await.unwrap();
    assert_eq!(a_fingerprint, b_fingerprint, "both sides must derive the same emoji fingerprint");

    rms_sync::pairing::confirm_as_initiator(&ctx_a, invite_id, true).await.unwrap();

    let a_ipns_public = {
        let slot = ctx_a.device().await.unwrap();
        let guard = slot.read().await;
        guard.as_ref().unwrap().ipns_public_key.clone()
    };
    let a_auth_public = {
        let slot = ctx_a.device().await.unwrap();
        let guard = slot.read().await;
        guard.as_ref().unwrap().auth_public_key.clone()
    };
    rms_sync::pairing::complete_as_joiner(&ctx_b, &a_ipns_public, &a_auth_public).await.unwrap();

    (ctx_a, ctx_b)
}

#[tokio::test]
async fn pairing_leaves_both_devices_synced_with_each_other_in_the_ring() {
    let (ctx_a, ctx_b) = pair_two_devices().await;

    let cfg_a = ctx_a.store.get_sync_config().await.unwrap().unwrap();
    let cfg_b = ctx_b.store.get_sync_config().await.unwrap().unwrap();
    assert_eq!(cfg_a.mode, rms_store::models::SyncMode::Synced.as_str());
    assert_eq!(cfg_b.mode, rms_store::models::SyncMode::Synced.as_str());
    assert_eq!(cfg_a.personal_key, cfg_b.personal_key, "both devices must share one PersonalKey");
    assert_eq!(cfg_a.broadcast_key, cfg_b.broadcast_key, "both devices must share one BroadcastKey");

    let device_id_a = ctx_a.device_id().await.unwrap();
    let peers_on_a = ctx_a.store.all_peer_sync_states().await.unwrap();
    assert_eq!(peers_on_a.len(), 1, "A should now track exactly one peer");
    assert_ne!(peers_on_a[0].device_id, device_id_a);
}

#[tokio::test]
async fn sync_after_pairing_applies_no_mutations_when_nothing_new_was_written() {
    let (ctx_a, ctx_b) = pair_two_devices().await;

    let engine_a = SyncEngine::new(ctx_a);
    let result_a = engine_a.sync().await.unwrap();
    assert_eq!(result_a.mutations_applied, 0);
    assert_eq!(result_a.conflicts_detected, 0);

    let engine_b = SyncEngine::new(ctx_b);
    let result_b = engine_b.sync().await.unwrap();
    assert_eq!(result_b.mutations_applied, 0);
    assert_eq!(result_b.conflicts_detected, 0);
}

async fn device_keys(ctx: &SyncContext) -> (rms_crypto::P256PublicKey, rms_crypto::P256PrivateKey) {
    let slot = ctx.device().await.unwrap();
    let guard = slot.read().await;
    let identity = guard.as_ref().unwrap();
    let auth_public_key = identity.auth_public_key.clone();
    let auth_private_key = rms_crypto::P256PrivateKey::from_bytes(&identity.auth_private_key.to_bytes()).unwrap();
    (auth_public_key, auth_private_key)
}

/// spec.md §8 scenario 3: a local mutation is still pending publish when a
/// conflicting remote mutation for the same target arrives during the same
/// sync cycle. The cycle must still record a conflict rather than silently
/// dropping the local change because it was published away earlier in the
/// same `sync()` call (see `SyncEngine::sync`'s pre-publish snapshot).
#[tokio::test]
async fn concurrent_edits_to_the_same_target_are_recorded_as_a_conflict() {
    let (ctx_a, ctx_b) = pair_two_devices().await;

    let target_uuid = Uuid::new_v4().to_string();
    let now = Utc::now();

    let (auth_pub_a, auth_priv_a) = device_keys(&ctx_a).await;
    let id_a = ctx_a.store.next_mutation_id().await.unwrap();
    let mutation_a = Mutation::create_signed(
        id_a,
        &target_uuid,
        TargetType::Record,
        Operation::Update { changes: vec![] },
        now,
        now,
        &auth_pub_a,
        &auth_priv_a,
    )
    .unwrap();
    enqueue_mutation(&ctx_a, &mutation_a).await.unwrap();

    let (auth_pub_b, auth_priv_b) = device_keys(&ctx_b).await;
    let id_b = ctx_b.store.next_mutation_id().await.unwrap();
    let mutation_b = Mutation::create_signed(
        id_b,
        &target_uuid,
        TargetType::Record,
        Operation::Delete,
        now,
        now,
        &auth_pub_b,
        &auth_priv_b,
    )
    .unwrap();
    enqueue_mutation(&ctx_b, &mutation_b).await.unwrap();

    // B publishes first so A's sync cycle has something to fetch.
    let engine_b = SyncEngine::new(ctx_b);
    let result_b = engine_b.sync().await.unwrap();
    assert_eq!(result_b.published, 1);

    let engine_a = SyncEngine::new(ctx_a.clone());
    let result_a = engine_a.sync().await.unwrap();
    assert_eq!(result_a.published, 1, "A's own pending mutation must still publish");
    assert_eq!(result_a.conflicts_detected, 1, "B's incoming mutation on the same target must conflict");

    let conflict = ctx_a.store.open_conflict_for_target(&target_uuid).await.unwrap();
    assert!(conflict.is_some(), "an open conflict row must exist for the contested target");
}
