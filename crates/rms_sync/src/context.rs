//! The process-wide context object every `rms_sync` entry point is
//! handed explicitly, replacing the module-level singletons the original
//! design leaned on (Design Note 4).
//!
//! Holds the local store, the blob-store collaborator, engine
//! configuration, and the device's long-lived keypairs once generated.
//! `publish_pending_mutations` and `sync()` take out one of the two
//! reentrancy guards here for their duration (spec.md §5 "Mutual
//! exclusion") and fail fast on a second concurrent caller rather than
//! queueing or blocking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rms_blobstore::BlobStore;
use rms_crypto::{Ed25519PrivateKey, Ed25519PublicKey, P256PrivateKey, P256PublicKey};
use rms_store::Store;

use crate::config::EngineConfig;
use crate::conflict::{MalformedReport, MAX_MALFORMED_REPORTS};
use crate::error::SyncError;

/// This device's persistent identity: one P-256 keypair (`authKey`,
/// ECDSA + ECDH) and one Ed25519 keypair (`ipnsKey`, mutable-name handle
/// and record signing). Generated once by `device::ensure_device_keys`
/// and cached here for the process lifetime.
pub struct DeviceIdentity {
    pub device_id: String,
    pub auth_private_key: P256PrivateKey,
    pub auth_public_key: P256PublicKey,
    pub ipns_private_key: Ed25519PrivateKey,
    pub ipns_public_key: Ed25519PublicKey,
}

/// Acquired for the duration of `publish_pending_mutations` or `sync()`;
/// a second concurrent call observes the flag already set and returns
/// `SyncError::PublishInProgress` / `SyncError::SyncInProgress` instead
/// of blocking (spec.md §5).
pub struct ReentrancyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ReentrancyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            Some(Self { flag })
        } else {
            None
        }
    }
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The handle every public `rms_sync` operation is passed. Cheap to
/// clone: the store pool and blob-store trait object are both
/// reference-counted internally.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Store,
    pub blob_store: Arc<dyn BlobStore>,
    pub config: Arc<EngineConfig>,
    device: Arc<tokio::sync::RwLock<Option<DeviceIdentity>>>,
    publishing: Arc<AtomicBool>,
    syncing: Arc<AtomicBool>,
    /// Bounded malformed-content report log (spec.md §4.10, ≤100 entries).
    reports: Arc<Mutex<VecDeque<MalformedReport>>>,
}

impl SyncContext {
    pub fn new(store: Store, blob_store: Arc<dyn BlobStore>, config: EngineConfig) -> Self {
        Self {
            store,
            blob_store,
            config: Arc::new(config),
            device: Arc::new(tokio::sync::RwLock::new(None)),
            publishing: Arc::new(AtomicBool::new(false)),
            syncing: Arc::new(AtomicBool::new(false)),
            reports: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Appends a malformed-content report, evicting the oldest once the
    /// log holds `MAX_MALFORMED_REPORTS` entries.
    pub(crate) fn record_malformed(&self, report: MalformedReport) {
        let mut reports = self.reports.lock();
        if reports.len() >= MAX_MALFORMED_REPORTS {
            reports.pop_front();
        }
        reports.push_back(report);
    }

    /// Snapshot of the current malformed-content report log, oldest first.
    pub fn malformed_reports(&self) -> Vec<MalformedReport> {
        self.reports.lock().iter().cloned().collect()
    }

    pub async fn device(&self) -> Option<Arc<tokio::sync::RwLock<Option<DeviceIdentity>>>> {
        if self.device.read().await.is_some() {
            Some(self.device.clone())
        } else {
            None
        }
    }

    pub(crate) fn device_slot(&self) -> &Arc<tokio::sync::RwLock<Option<DeviceIdentity>>> {
        &self.device
    }

    pub async fn device_id(&self) -> Result<String, SyncError> {
        self.device
            .read()
            .await
            .as_ref()
            .map(|d| d.device_id.clone())
            .ok_or(SyncError::NotConfigured)
    }

    pub(crate) fn acquire_publish_guard(&self) -> Result<ReentrancyGuard<'_>, SyncError> {
        ReentrancyGuard::acquire(&self.publishing).ok_or(SyncError::PublishInProgress)
    }

    pub(crate) fn acquire_sync_guard(&self) -> Result<ReentrancyGuard<'_>, SyncError> {
        ReentrancyGuard::acquire(&self.syncing).ok_or(SyncError::SyncInProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrancy_guard_blocks_second_acquire() {
        let flag = AtomicBool::new(false);
        let first = ReentrancyGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(ReentrancyGuard::acquire(&flag).is_none());
        drop(first);
        assert!(ReentrancyGuard::acquire(&flag).is_some());
    }
}
