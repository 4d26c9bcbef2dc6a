//! Content-addressed result cache.
//!
//! Cache entries are keyed by node fingerprint and hold the ordered stream of
//! values the node yielded. The guarantees:
//!
//! - **At-most-one-producer**: a builder lock on the fingerprint is acquired
//!   before the first `put`; concurrent requestors wait for the seal
//!   notification and replay the completed stream.
//! - **Monotonic append**: value indices are contiguous from 0.
//! - **Durability**: `seal` is one atomic flag write; readers either see a
//!   sealed complete stream or treat the entry as absent.
//! - **Eviction**: bounded by a byte budget; least-recently-read sealed
//!   entries go first; unsealed entries are pinned.
//!
//! Values above a size threshold are materialized in the provider's blob
//! store and held in the entry by URI.

pub mod blob;

pub use blob::{blob_store_for, BlobStore, InMemoryBlobStore, LocalDirStore};

use dfm::error::{DfmError, Result};
use dfm::fingerprint::Fingerprint;
use dfm_broker::keys::{self, cache_fields};
use dfm_broker::BrokerHandle;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const BLOB_REF_KEY: &str = "$blob";

/// Tuning knobs for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Eviction budget over all sealed entries.
    pub budget_bytes: u64,
    /// Values serialized larger than this go to the blob store.
    pub blob_threshold_bytes: usize,
    /// Builder-lock TTL. Must exceed the longest expected node runtime.
    pub lock_ttl: Duration,
    /// Fallback polling cadence while waiting on a seal.
    pub seal_poll_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: dfm::config::DEFAULT_CACHE_BUDGET_BYTES,
            blob_threshold_bytes: 64 * 1024,
            lock_ttl: Duration::from_secs(15 * 60),
            seal_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead {
    /// Sealed entry: the complete value stream in yield order.
    Hit(Vec<Value>),
    /// No entry and no producer.
    Miss,
    /// Another producer holds the builder lock; the entry is not sealed yet.
    Building,
}

/// The content-addressed value cache, layered over the broker and a blob
/// store.
#[derive(Clone)]
pub struct ValueCache {
    broker: BrokerHandle,
    blobs: Arc<dyn BlobStore>,
    config: CacheConfig,
}

impl ValueCache {
    pub fn new(broker: BrokerHandle, blobs: Arc<dyn BlobStore>, config: CacheConfig) -> Self {
        Self {
            broker,
            blobs,
            config,
        }
    }

    /// Read an entry. Sealed entries are replayed and touch the LRU clock;
    /// unsealed entries report as [`CacheRead::Building`] while their
    /// producer is alive and as a miss afterwards.
    pub async fn get(&self, fp: &Fingerprint) -> Result<CacheRead> {
        let meta_key = keys::cache_meta(fp);
        let sealed = self
            .broker
            .hash_get(&meta_key, cache_fields::SEALED)
            .await?;

        if sealed.as_deref() == Some("1") {
            let raw = self.broker.list_range(&keys::cache(fp), 0, -1).await?;
            let mut values = Vec::with_capacity(raw.len());
            for item in raw {
                values.push(self.inflate(&item).await?);
            }
            self.touch(fp).await;
            return Ok(CacheRead::Hit(values));
        }

        if self.broker.exists(&keys::cache_lock(fp)).await? {
            return Ok(CacheRead::Building);
        }

        Ok(CacheRead::Miss)
    }

    /// Try to become the producer for `fp`. The lock auto-expires after
    /// [`CacheConfig::lock_ttl`] so a crashed producer cannot pin the entry
    /// forever.
    pub async fn try_acquire_builder(&self, fp: &Fingerprint) -> Result<bool> {
        self.broker
            .set_nx_ex(&keys::cache_lock(fp), "1", self.config.lock_ttl)
            .await
            .map_err(Into::into)
    }

    /// Drop the builder lock without sealing (producer failed; the partial
    /// entry should be invalidated separately).
    pub async fn release_builder(&self, fp: &Fingerprint) -> Result<()> {
        self.broker.delete(&keys::cache_lock(fp)).await?;
        Ok(())
    }

    /// Append the value at `index` to the entry. Indices must be contiguous
    /// from 0; the caller holds the builder lock.
    pub async fn put(&self, fp: &Fingerprint, index: usize, value: &Value) -> Result<()> {
        let entry_key = keys::cache(fp);
        let current = self.broker.list_len(&entry_key).await?;
        if current != index {
            return Err(DfmError::Cache(format!(
                "non-contiguous cache write for {fp}: index {index}, expected {current}"
            )));
        }

        let serialized = serde_json::to_string(value)?;
        let stored = if serialized.len() > self.config.blob_threshold_bytes {
            let uri = self.blobs.store(serialized.as_bytes()).await?;
            debug!("cache value {fp}[{index}] materialized at {uri}");
            serde_json::to_string(&serde_json::json!({ BLOB_REF_KEY: uri }))?
        } else {
            serialized
        };

        let bytes = stored.len() as u64;
        self.broker.push_back(&entry_key, &stored).await?;

        let meta_key = keys::cache_meta(fp);
        let previous: u64 = self
            .broker
            .hash_get(&meta_key, cache_fields::BYTES)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        self.broker
            .hash_set(&meta_key, cache_fields::BYTES, &(previous + bytes).to_string())
            .await?;

        Ok(())
    }

    /// Mark the entry complete, release the builder lock, announce the seal,
    /// and enforce the eviction budget.
    pub async fn seal(&self, fp: &Fingerprint) -> Result<()> {
        self.broker
            .hash_set(&keys::cache_meta(fp), cache_fields::SEALED, "1")
            .await?;
        self.touch(fp).await;
        self.broker.delete(&keys::cache_lock(fp)).await?;
        self.broker
            .publish(keys::CACHE_SEALED_CHANNEL, &fp.to_string())
            .await?;
        if let Err(e) = self.evict_over_budget().await {
            warn!("cache eviction pass failed: {e}");
        }
        Ok(())
    }

    /// Drop an unsealed partial entry while keeping the builder lock.
    /// Used by a producer about to retry from scratch, and to clear stale
    /// partial state left by a crashed producer whose lock expired.
    pub async fn reset_unsealed(&self, fp: &Fingerprint) -> Result<()> {
        let raw = self.broker.list_range(&keys::cache(fp), 0, -1).await?;
        for item in raw {
            if let Some(uri) = blob_uri(&item) {
                if let Err(e) = self.blobs.delete(&uri).await {
                    warn!("cannot delete blob behind {fp}: {e}");
                }
            }
        }
        self.broker.delete(&keys::cache(fp)).await?;
        self.broker.delete(&keys::cache_meta(fp)).await?;
        Ok(())
    }

    /// Drop the entry and its blobs.
    pub async fn invalidate(&self, fp: &Fingerprint) -> Result<()> {
        let raw = self.broker.list_range(&keys::cache(fp), 0, -1).await?;
        for item in raw {
            if let Some(uri) = blob_uri(&item) {
                if let Err(e) = self.blobs.delete(&uri).await {
                    warn!("cannot delete blob behind {fp}: {e}");
                }
            }
        }
        self.broker.delete(&keys::cache(fp)).await?;
        self.broker.delete(&keys::cache_meta(fp)).await?;
        self.broker.delete(&keys::cache_lock(fp)).await?;
        self.broker
            .zset_remove(keys::CACHE_LRU, &fp.to_string())
            .await?;
        Ok(())
    }

    /// Wait until the entry seals (another producer is building it) and
    /// return its values, or `None` once the wait is hopeless: the producer
    /// vanished or the lock TTL elapsed.
    pub async fn wait_for_seal(&self, fp: &Fingerprint) -> Result<Option<Vec<Value>>> {
        let mut notifications = self
            .broker
            .subscribe(keys::CACHE_SEALED_CHANNEL)
            .await?;
        let deadline = tokio::time::Instant::now() + self.config.lock_ttl;

        loop {
            match self.get(fp).await? {
                CacheRead::Hit(values) => return Ok(Some(values)),
                CacheRead::Miss => return Ok(None),
                CacheRead::Building => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = notifications.next() => {}
                _ = tokio::time::sleep(self.config.seal_poll_interval) => {}
            }
        }
    }

    async fn touch(&self, fp: &Fingerprint) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let _ = self
            .broker
            .zset_add(keys::CACHE_LRU, &fp.to_string(), now_ms)
            .await;
        let _ = self
            .broker
            .hash_set(
                &keys::cache_meta(fp),
                cache_fields::LAST_READ_MS,
                &now_ms.to_string(),
            )
            .await;
    }

    /// Evict least-recently-read sealed entries until the budget holds.
    /// Unsealed entries never appear in the LRU set, so they are safe.
    async fn evict_over_budget(&self) -> Result<()> {
        let members = self.broker.zset_range(keys::CACHE_LRU, 0, -1).await?;

        let mut total: u64 = 0;
        let mut sizes = Vec::with_capacity(members.len());
        for member in &members {
            let Ok(fp) = Fingerprint::from_hex(member) else {
                continue;
            };
            let bytes: u64 = self
                .broker
                .hash_get(&keys::cache_meta(&fp), cache_fields::BYTES)
                .await?
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);
            total += bytes;
            sizes.push((fp, bytes));
        }

        for (fp, bytes) in sizes {
            if total <= self.config.budget_bytes {
                break;
            }
            debug!("evicting cache entry {fp} ({bytes} bytes)");
            self.invalidate(&fp).await?;
            total = total.saturating_sub(bytes);
        }
        Ok(())
    }

    async fn inflate(&self, raw: &str) -> Result<Value> {
        if let Some(uri) = blob_uri(raw) {
            let bytes = self.blobs.get(&uri).await?;
            return Ok(serde_json::from_slice(&bytes)?);
        }
        Ok(serde_json::from_str(raw)?)
    }
}

fn blob_uri(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get(BLOB_REF_KEY)?.as_str().map(String::from)
}
