//! The scheduled sync loop (spec.md §4.9): a foreground/background
//! cadence that publishes pending mutations and then walks every known
//! peer, fetching and merging whatever is new.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rms_crypto::Ed25519PublicKey;
use rms_proto::{chunks_to_sync, validate_chunk_index, DeviceManifest, DeviceRing, Mutation, MutationChunk};
use rms_store::models::{CidHistoryRow, PeerSyncStateRow};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

use crate::conflict::{self, classify_malformed};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::publish::publish_pending_mutations;

/// Progress events a UI layer can subscribe to (spec.md §4.9 "six
/// events").
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStart,
    SyncComplete { mutations_applied: usize, conflicts: usize },
    SyncError { message: String },
    MutationReceived { target_uuid: String },
    ConflictDetected { target_uuid: String },
    StateChange { foreground: bool },
}

/// Outcome of one `sync()` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncResult {
    pub published: usize,
    pub mutations_applied: usize,
    pub conflicts_detected: usize,
    pub peers_synced: usize,
    pub peers_failed: usize,
}

/// Owns the scheduling state; one per running device. Cheap to share
/// behind an `Arc` with the task `spawn` hands off to tokio.
pub struct SyncEngine {
    ctx: SyncContext,
    event_tx: broadcast::Sender<SyncEvent>,
    foreground: AtomicBool,
    wake: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self { ctx, event_tx, foreground: AtomicBool::new(true), wake: Notify::new(), shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Visibility toggle (spec.md §4.9): hidden→visible wakes the loop
    /// immediately instead of waiting out the background interval.
    pub fn set_foreground(&self, foreground: bool) {
        let was_foreground = self.foreground.swap(foreground, Ordering::SeqCst);
        if foreground && !was_foreground {
            self.wake.notify_one();
        }
        let _ = self.event_tx.send(SyncEvent::StateChange { foreground });
    }

    /// Cancels the next scheduled wakeup. An in-flight `sync()` runs to
    /// completion; this only stops the loop from scheduling another one
    /// (spec.md §4.9 "stop does not interrupt an in-progress sync").
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawns the scheduling loop as a background task.
    pub fn spawn(engine: Arc<SyncEngine>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown_rx = engine.shutdown_tx.subscribe();
            info!("sync engine started");
            loop {
                let interval = engine.current_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = engine.wake.notified() => {
                        debug!("sync loop woken early");
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("sync engine shutting down");
                            return;
                        }
                    }
                }
                if *shutdown_rx.borrow() {
                    return;
                }
                if let Err(e) = engine.sync().await {
                    warn!(error = %e, "scheduled sync cycle failed");
                }
            }
        })
    }

    fn current_interval(&self) -> Duration {
        let sync = &self.ctx.config.sync;
        let ms = if self.foreground.load(Ordering::SeqCst) { sync.foreground_interval_ms } else { sync.background_interval_ms };
        Duration::from_millis(ms)
    }

    /// `sync()` (spec.md §4.9): publish pending mutations, then fetch and
    /// merge every registered peer's new mutations. Non-reentrant — a
    /// second concurrent call fails fast with `SyncError::SyncInProgress`.
    pub async fn sync(&self) -> Result<SyncResult, SyncError> {
        let _guard = self.ctx.acquire_sync_guard()?;
        let _ = self.event_tx.send(SyncEvent::SyncStart);

        // Snapshot the locally-authored mutations still in our own queue
        // before publishing them away, so a peer's chunk arriving later in
        // this same cycle can still be checked against them (spec.md §8
        // scenario 3: "local update pending; remote update arrives").
        let local_mutations: Vec<Mutation> = self
            .ctx
            .store
            .pending_mutations()
            .await?
            .iter()
            .filter_map(|row| serde_json::from_str::<Mutation>(&row.json).ok())
            .collect();

        let mut result = SyncResult::default();
        match publish_pending_mutations(&self.ctx).await {
            Ok(published) => result.published = published.count,
            Err(SyncError::NotConfigured) => {}
            Err(e) => {
                let _ = self.event_tx.send(SyncEvent::SyncError { message: e.to_string() });
                return Err(e);
            }
        }

        let base_interval_ms = self.current_interval().as_millis() as u64;
        let peers = self.ctx.store.all_peer_sync_states().await?;
        for peer in peers {
            if self.is_backing_off(&peer, base_interval_ms) {
                continue;
            }
            match self.sync_peer(&peer, &local_mutations).await {
                Ok(outcome) => {
                    result.mutations_applied += outcome.mutations_applied;
                    result.conflicts_detected += outcome.conflicts_detected;
                    result.peers_synced += 1;
                }
                Err(e) => {
                    warn!(device_id = %peer.device_id, error = %e, "peer sync cycle failed");
                    let failures = (peer.consecutive_failures as u32 + 1).min(self.ctx.config.sync.max_consecutive_failures);
                    if failures >= self.ctx.config.sync.max_consecutive_failures {
                        warn!(device_id = %peer.device_id, "peer sync has hit the consecutive-failure cap, backing off at the max interval");
                    }
                    self.ctx.store.record_peer_sync_failure(&peer.device_id, Utc::now()).await?;
                    result.peers_failed += 1;
                }
            }
        }

        let _ = self.event_tx.send(SyncEvent::SyncComplete {
            mutations_applied: result.mutations_applied,
            conflicts: result.conflicts_detected,
        });
        Ok(result)
    }

    /// A peer with consecutive failures waits out an exponential backoff
    /// (spec.md §4.9, §8) before the next attempt rather than retrying
    /// every cadence tick.
    fn is_backing_off(&self, peer: &PeerSyncStateRow, base_interval_ms: u64) -> bool {
        let Some(last_attempted) = peer.last_attempted_at else { return false };
        if peer.consecutive_failures == 0 {
            return false;
        }
        let wait_ms = self.ctx.config.sync.backoff_interval_ms(base_interval_ms, peer.consecutive_failures as u32);
        let due_at = last_attempted + chrono::Duration::milliseconds(wait_ms as i64);
        Utc::now() < due_at
    }

    /// One peer's cycle (spec.md §4.9 steps a-f). `local_mutations` is the
    /// snapshot of what was in our own queue at the start of this cycle,
    /// used for conflict detection against incoming mutations.
    async fn sync_peer(&self, peer: &PeerSyncStateRow, local_mutations: &[Mutation]) -> Result<SyncResult, SyncError> {
        let mut outcome = SyncResult::default();

        // a) resolve the peer's mutable name; skip entirely if the
        // manifest CID hasn't moved since the last cycle.
        let ipns_public = Ed25519PublicKey::from_bytes(&peer.ipns_public_key)?;
        let Some(manifest_cid) = self.ctx.blob_store.resolve_name(&ipns_public).await? else {
            return Ok(outcome);
        };
        let previous_cid_history = self.ctx.store.get_cid_history(&peer.device_id).await?;
        if previous_cid_history.as_ref().map(|p| p.current_cid.as_str()) == Some(manifest_cid.as_str()) {
            return Ok(outcome);
        }

        let manifest_bytes = self.ctx.blob_store.fetch(&manifest_cid).await?;
        let manifest: DeviceManifest = serde_json::from_slice(&manifest_bytes)?;

        let sync_config = self.ctx.store.get_sync_config().await?.ok_or(SyncError::NotConfigured)?;
        let broadcast_key: [u8; 32] = sync_config
            .broadcast_key
            .clone()
            .ok_or(SyncError::NotConfigured)?
            .try_into()
            .map_err(|_| SyncError::Other("bad broadcast key length".into()))?;
        let personal_key: [u8; 32] = sync_config
            .personal_key
            .clone()
            .ok_or(SyncError::NotConfigured)?
            .try_into()
            .map_err(|_| SyncError::Other("bad personal key length".into()))?;

        // b) decrypt the DeviceRing with BroadcastKey, find the peer's
        // announced lastSyncedId; skip if it isn't ahead of ours.
        let ring_bytes = self.ctx.blob_store.fetch(&manifest.device_ring_cid).await?;
        let ring = DeviceRing::decrypt(&broadcast_key, &ring_bytes)?;
        let Some(entry) = ring.devices.iter().find(|d| d.device_id == peer.device_id) else {
            return Ok(outcome);
        };
        let announced = entry.last_synced_id.unwrap_or(0);
        if announced <= peer.last_synced_id as u64 {
            self.remember_manifest_cid(&peer.device_id, &manifest_cid, previous_cid_history).await?;
            return Ok(outcome);
        }

        // c) decrypt the ChunkIndex with PersonalKey, compute which
        // chunks cover mutations we haven't seen yet.
        let chunk_index = DeviceManifest::decrypt_chunk_index(&personal_key, &manifest.chunk_index)?;
        let latest_mutation_id = DeviceManifest::decrypt_latest_mutation_id(&personal_key, &manifest.latest_mutation_id)?;
        validate_chunk_index(&chunk_index, latest_mutation_id)?;
        let chunks = chunks_to_sync(&chunk_index, peer.last_synced_id as u64);

        let known_device_ids: Vec<String> = ring.devices.iter().map(|d| d.device_id.clone()).collect();
        let mut highest_applied = peer.last_synced_id as u64;

        // d)-f) fetch each chunk, verify and apply each mutation in order.
        for chunk_entry in chunks {
            let ciphertext = self.ctx.blob_store.fetch(&chunk_entry.cid).await?;
            let chunk = MutationChunk::decrypt(&personal_key, &ciphertext)?;
            let mut mutations = chunk.mutations;
            mutations.sort_by_key(|m| m.id);

            for mutation in mutations {
                if mutation.id <= peer.last_synced_id as u64 {
                    continue;
                }
                let _ = self.event_tx.send(SyncEvent::MutationReceived { target_uuid: mutation.target_uuid.clone() });

                if let Some(reason) = classify_malformed(&mutation, Utc::now(), &known_device_ids) {
                    conflict::report_malformed(&self.ctx, reason, Some(&mutation));
                    highest_applied = mutation.id;
                    continue;
                }

                if conflict::maybe_self_wipe(&self.ctx, &mutation).await? {
                    return Ok(outcome);
                }

                match self.apply_incoming(&mutation, local_mutations).await {
                    Ok(had_conflict) => {
                        outcome.mutations_applied += 1;
                        if had_conflict {
                            outcome.conflicts_detected += 1;
                            let _ = self.event_tx.send(SyncEvent::ConflictDetected { target_uuid: mutation.target_uuid.clone() });
                        }
                        highest_applied = mutation.id;
                    }
                    Err(e) => {
                        warn!(mutation = %mutation.uuid, error = %e, "failed to apply incoming mutation");
                    }
                }
            }
        }

        self.ctx.store.record_peer_sync_success(&peer.device_id, highest_applied, Utc::now()).await?;
        self.remember_manifest_cid(&peer.device_id, &manifest_cid, previous_cid_history).await?;
        Ok(outcome)
    }

    /// Tracks the last-seen manifest CID per peer (bounded history, spec.md
    /// §6 `chunkHistoryMax`) so the next cycle can skip peers whose
    /// manifest hasn't moved.
    async fn remember_manifest_cid(
        &self,
        device_id: &str,
        new_cid: &str,
        previous: Option<CidHistoryRow>,
    ) -> Result<(), SyncError> {
        let mut history: Vec<String> = match &previous {
            Some(row) => serde_json::from_str(&row.previous_json).unwrap_or_default(),
            None => Vec::new(),
        };
        if let Some(row) = &previous {
            history.insert(0, row.current_cid.clone());
        }
        history.truncate(self.ctx.config.sync.chunk_history_max);
        self.ctx.store.upsert_cid_history(device_id, new_cid, &serde_json::to_string(&history)?).await?;
        Ok(())
    }

    /// Checks an incoming mutation against this cycle's local mutations
    /// for a conflict (spec.md §4.9 step e); returns whether one was
    /// recorded. A mutation that clears this check is verified and
    /// conflict-free, which is as far as this crate's cycle goes — writing
    /// it into the abstract `LocalStore` (spec.md §1, out of scope here)
    /// is left to whatever concrete `LocalStore` a deployment provides.
    async fn apply_incoming(&self, incoming: &Mutation, local_mutations: &[Mutation]) -> Result<bool, SyncError> {
        for local in local_mutations {
            let detected = conflict::detect(local, incoming);
            if !detected.is_empty() {
                conflict::record_conflicts(&self.ctx, local, incoming, &detected).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::device::{setup_device, ProviderConfig};
    use crate::publish::enqueue_mutation;
    use rms_blobstore::InMemoryBlobStore;
    use rms_proto::{Operation, TargetType};
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn synced_ctx(name: &str) -> SyncContext {
        let db_path = PathBuf::from(format!("/tmp/rms-sync-engine-test-{}.db", Uuid::new_v4()));
        let store = rms_store::Store::open(&db_path).await.unwrap();
        let blob_store: Arc<dyn rms_blobstore::BlobStore> = Arc::new(InMemoryBlobStore::new());
        let ctx = SyncContext::new(store, blob_store, EngineConfig::new(vec!["http://localhost:9000".into()]));
        let cfg = ProviderConfig { gateway_urls: vec!["http://localhost:9000".into()] };
        setup_device(&ctx, &cfg, name, None).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn concurrent_sync_calls_are_rejected() {
        let ctx = synced_ctx("alice").await;
        let engine = SyncEngine::new(ctx);
        let _first = engine.ctx.acquire_sync_guard().unwrap();
        let err = engine.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::SyncInProgress));
    }

    #[tokio::test]
    async fn sync_with_no_peers_just_publishes() {
        let ctx = synced_ctx("alice").await;
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

        let engine = SyncEngine::new(ctx);
        let result = engine.sync().await.unwrap();
        assert_eq!(result.published, 1);
        assert_eq!(result.peers_synced, 0);
    }

    #[tokio::test]
    async fn visibility_wake_notifies_the_loop() {
        let ctx = synced_ctx("alice").await;
        let engine = SyncEngine::new(ctx);
        engine.set_foreground(false);
        let mut events = engine.subscribe();
        engine.set_foreground(true);
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SyncEvent::StateChange { foreground: true }));
    }

    #[tokio::test]
    async fn backing_off_peer_is_skipped_until_interval_elapses() {
        let ctx = synced_ctx("alice").await;
        ctx.store.upsert_peer_sync_state("bob-device", &[9u8; 32]).await.unwrap();
        ctx.store.record_peer_sync_failure("bob-device", chrono::Utc::now()).await.unwrap();
        let peers = ctx.store.all_peer_sync_states().await.unwrap();
        let peer = peers.iter().find(|p| p.device_id == "bob-device").unwrap();

        let engine = SyncEngine::new(ctx);
        assert!(engine.is_backing_off(peer, 15_000));
    }
}
