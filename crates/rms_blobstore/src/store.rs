//! The `BlobStore` abstraction (spec.md §4.4) and its two implementations:
//! an in-memory test double and a real `reqwest`-based HTTP gateway
//! client. The pinning-service wire dialect itself stays out of scope
//! (spec.md §1); this crate speaks only the four operations the sync
//! engine needs.

use async_trait::async_trait;
use chrono::Utc;

use rms_crypto::{sha256, Ed25519PrivateKey, Ed25519PublicKey};
use rms_proto::{derive_name, MutableNameRecord};

use crate::error::BlobStoreError;
use crate::gateway::GatewayManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub cid: String,
    pub size: usize,
}

/// Abstract content-addressed blob store with a mutable-naming layer
/// (spec.md §4.4).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: &[u8], name: Option<&str>) -> Result<UploadResult, BlobStoreError>;

    async fn fetch(&self, cid: &str) -> Result<Vec<u8>, BlobStoreError>;

    /// Idempotent: a 404 from the gateway is treated as success.
    async fn unpin(&self, cid: &str) -> Result<(), BlobStoreError>;

    /// Queries all gateways in parallel; returns the highest-sequence
    /// record where sequence is exposed, otherwise any non-null result.
    async fn resolve_name(&self, name_public_key: &Ed25519PublicKey) -> Result<Option<String>, BlobStoreError>;

    /// Signs an Ed25519 record over `value‖validity‖validityType‖sequence`
    /// and registers it under `deriveName(namePub) = hex(sha256(namePub))`.
    async fn publish_name(
        &self,
        name_private_key: &Ed25519PrivateKey,
        cid: &str,
        sequence: u64,
    ) -> Result<(), BlobStoreError>;
}

fn content_hash_cid(bytes: &[u8]) -> String {
    format!("bafy{}", hex::encode(sha256(bytes)))
}

/// Pure in-memory `BlobStore` for tests: one process, one gateway,
/// content-addressed by a local SHA-256-derived "CID".
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
    names: tokio::sync::RwLock<std::collections::HashMap<String, MutableNameRecord>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, bytes: &[u8], _name: Option<&str>) -> Result<UploadResult, BlobStoreError> {
        let cid = content_hash_cid(bytes);
        self.blobs.write().await.insert(cid.clone(), bytes.to_vec());
        Ok(UploadResult { cid, size: bytes.len() })
    }

    async fn fetch(&self, cid: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.blobs
            .read()
            .await
            .get(cid)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(cid.to_string()))
    }

    async fn unpin(&self, cid: &str) -> Result<(), BlobStoreError> {
        self.blobs.write().await.remove(cid);
        Ok(())
    }

    async fn resolve_name(&self, name_public_key: &Ed25519PublicKey) -> Result<Option<String>, BlobStoreError> {
        let key = derive_name(&name_public_key.to_bytes());
        let names = self.names.read().await;
        Ok(names.get(&key).and_then(|r| r.cid()).map(str::to_string))
    }

    async fn publish_name(
        &self,
        name_private_key: &Ed25519PrivateKey,
        cid: &str,
        sequence: u64,
    ) -> Result<(), BlobStoreError> {
        let validity = Utc::now() + chrono::Duration::days(365);
        let record = MutableNameRecord::sign(cid, sequence, validity, name_private_key);
        let key = derive_name(&name_private_key.public_key().to_bytes());
        self.names.write().await.insert(key, record);
        Ok(())
    }
}

/// `BlobStore` over a set of HTTP pinning gateways, ranked by
/// `GatewayManager`. The exact request/response shapes of the gateway
/// dialect are intentionally abstract (spec.md §1): this client assumes a
/// gateway exposes `PUT {base}/upload`, `GET {base}/fetch/{cid}`,
/// `DELETE {base}/unpin/{cid}`, and a mutable-name record store at
/// `{base}/name/{derivedName}`.
pub struct HttpGatewayBlobStore {
    client: reqwest::Client,
    gateways: tokio::sync::RwLock<GatewayManager>,
    gateway_timeout: std::time::Duration,
}

impl HttpGatewayBlobStore {
    pub fn new(gateway_urls: Vec<String>, gateway_timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            gateways: tokio::sync::RwLock::new(GatewayManager::new(gateway_urls)),
            gateway_timeout,
        }
    }
}

#[async_trait]
impl BlobStore for HttpGatewayBlobStore {
    async fn upload(&self, bytes: &[u8], name: Option<&str>) -> Result<UploadResult, BlobStoreError> {
        let urls = self.gateways.read().await.ordered_urls(Utc::now());
        for url in urls {
            let mut request = self
                .client
                .put(format!("{url}/upload"))
                .timeout(self.gateway_timeout)
                .body(bytes.to_vec());
            if let Some(name) = name {
                request = request.query(&[("name", name)]);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let cid = resp.text().await.map_err(|e| BlobStoreError::UploadFailed(e.to_string()))?;
                    self.gateways.write().await.record_success(&url, Utc::now());
                    return Ok(UploadResult { cid: cid.trim().to_string(), size: bytes.len() });
                }
                _ => {
                    self.gateways.write().await.record_failure(&url, Utc::now());
                    continue;
                }
            }
        }
        Err(BlobStoreError::UploadFailed("all gateways failed".into()))
    }

    async fn fetch(&self, cid: &str) -> Result<Vec<u8>, BlobStoreError> {
        let urls = self.gateways.read().await.ordered_urls(Utc::now());
        if urls.is_empty() {
            return Err(BlobStoreError::NoGateways);
        }
        for url in urls {
            let result = self
                .client
                .get(format!("{url}/fetch/{cid}"))
                .timeout(self.gateway_timeout)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Err(BlobStoreError::NotFound(cid.to_string()));
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    self.gateways.write().await.record_failure(&url, Utc::now());
                    return Err(BlobStoreError::RateLimited);
                }
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.map_err(|e| BlobStoreError::FetchFailed(e.to_string()))?;
                    self.gateways.write().await.record_success(&url, Utc::now());
                    return Ok(bytes.to_vec());
                }
                _ => {
                    self.gateways.write().await.record_failure(&url, Utc::now());
                    continue;
                }
            }
        }
        Err(BlobStoreError::FetchFailed(format!("all gateways failed for {cid}")))
    }

    async fn unpin(&self, cid: &str) -> Result<(), BlobStoreError> {
        let urls = self.gateways.read().await.ordered_urls(Utc::now());
        for url in urls {
            let result = self
                .client
                .delete(format!("{url}/unpin/{cid}"))
                .timeout(self.gateway_timeout)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    self.gateways.write().await.record_success(&url, Utc::now());
                    return Ok(());
                }
                _ => {
                    self.gateways.write().await.record_failure(&url, Utc::now());
                    continue;
                }
            }
        }
        tracing::warn!(cid, "unpin failed on every gateway, ignoring (best-effort)");
        Ok(())
    }

    async fn resolve_name(&self, name_public_key: &Ed25519PublicKey) -> Result<Option<String>, BlobStoreError> {
        let derived = derive_name(&name_public_key.to_bytes());
        let urls = self.gateways.read().await.ordered_urls(Utc::now());

        let fetches = urls.iter().map(|url| {
            let client = self.client.clone();
            let url = url.clone();
            let derived = derived.clone();
            let timeout = self.gateway_timeout;
            async move {
                client
                    .get(format!("{url}/name/{derived}"))
                    .timeout(timeout)
                    .send()
                    .await
                    .ok()?
                    .json::<MutableNameRecord>()
                    .await
                    .ok()
            }
        });

        let records: Vec<MutableNameRecord> = futures::future::join_all(fetches).await.into_iter().flatten().collect();
        let best = records.into_iter().max_by_key(|r| r.sequence);
        Ok(best.and_then(|r| r.cid().map(str::to_string)))
    }

    async fn publish_name(
        &self,
        name_private_key: &Ed25519PrivateKey,
        cid: &str,
        sequence: u64,
    ) -> Result<(), BlobStoreError> {
        let validity = Utc::now() + chrono::Duration::days(365);
        let record = MutableNameRecord::sign(cid, sequence, validity, name_private_key);
        let derived = derive_name(&name_private_key.public_key().to_bytes());
        let body = serde_json::to_vec(&record)?;

        let urls = self.gateways.read().await.ordered_urls(Utc::now());
        let mut last_err = None;
        for url in urls {
            let result = self
                .client
                .put(format!("{url}/name/{derived}"))
                .timeout(self.gateway_timeout)
                .body(body.clone())
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    self.gateways.write().await.record_success(&url, Utc::now());
                    return Ok(());
                }
                Ok(resp) => {
                    self.gateways.write().await.record_failure(&url, Utc::now());
                    last_err = Some(format!("gateway returned {}", resp.status()));
                }
                Err(e) => {
                    self.gateways.write().await.record_failure(&url, Utc::now());
                    last_err = Some(e.to_string());
                }
            }
        }
        Err(BlobStoreError::UploadFailed(last_err.unwrap_or_else(|| "no gateways".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rms_crypto::generate_ed25519_keypair;

    #[tokio::test]
    async fn in_memory_store_upload_fetch_round_trip() {
        let store = InMemoryBlobStore::new();
        let result = store.upload(b"hello", None).await.unwrap();
        let back = store.fetch(&result.cid).await.unwrap();
        assert_eq!(back, b"hello");
    }

    #[tokio::test]
    async fn fetch_missing_cid_is_not_found() {
        let store = InMemoryBlobStore::new();
        assert!(matches!(store.fetch("missing").await, Err(BlobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn publish_then_resolve_name_round_trips() {
        let store = InMemoryBlobStore::new();
        let (private, public) = generate_ed25519_keypair();
        store.publish_name(&private, "bafy-cid-1", 1).await.unwrap();
        let resolved = store.resolve_name(&public).await.unwrap();
        assert_eq!(resolved, Some("bafy-cid-1".to_string()));
    }

    #[tokio::test]
    async fn unpin_is_idempotent() {
        let store = InMemoryBlobStore::new();
        let result = store.upload(b"x", None).await.unwrap();
        store.unpin(&result.cid).await.unwrap();
        store.unpin(&result.cid).await.unwrap();
    }
}
