//! The broker abstraction coupling the DFM services.
//!
//! All inter-service state lives behind the [`Broker`] trait: FIFO lists,
//! hashes, score-ordered delay queues, pub/sub channels, and expiring claim
//! keys. Services share no memory; everything they agree on goes through
//! here.
//!
//! Two implementations are provided: [`RedisBroker`] for deployments and
//! [`MemoryBroker`] for tests and single-node use.

pub mod keys;
mod memory;
mod redis_broker;
pub mod store;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;
pub use store::RequestStore;

use async_trait::async_trait;
use dfm::pipeline::NodeId;
use dfm::request::RequestId;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a broker implementation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("broker serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Connection and command failures are worth retrying with backoff;
    /// malformed payloads are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Command(_))
    }
}

impl From<BrokerError> for dfm::DfmError {
    fn from(err: BrokerError) -> Self {
        dfm::DfmError::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// One unit of executor work: a node of a request.
///
/// Serialized as JSON onto `exec:queue` and into `sched:delayed` members.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueEntry {
    pub request_id: RequestId,
    pub node_id: NodeId,
}

impl QueueEntry {
    pub fn new(request_id: RequestId, node_id: NodeId) -> Self {
        Self {
            request_id,
            node_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Shared handle to a broker implementation.
pub type BrokerHandle = Arc<dyn Broker>;

/// The durable key/value substrate all services couple through.
///
/// Keys are plain strings (see [`keys`] for the normative keyspace); values
/// are strings, JSON-encoded by the caller. Every operation is atomic with
/// respect to concurrent callers.
#[async_trait]
pub trait Broker: Send + Sync {
    // ------------------------------------------------------------------
    // Lists (FIFO queues)
    // ------------------------------------------------------------------

    /// Append to the tail of a list.
    async fn push_back(&self, key: &str, value: &str) -> Result<()>;

    /// Pop the head of a list, non-blocking.
    async fn pop_front(&self, key: &str) -> Result<Option<String>>;

    /// Pop the head of a list, waiting up to `timeout` for an element.
    async fn blocking_pop_front(&self, key: &str, timeout: Duration)
        -> Result<Option<String>>;

    /// Read a slice of a list without consuming it. Negative indices count
    /// from the tail, `-1` being the last element.
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    // ------------------------------------------------------------------
    // Hashes
    // ------------------------------------------------------------------

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Set several fields in one atomic write.
    async fn hash_set_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hash_del(&self, key: &str, field: &str) -> Result<()>;

    /// Compare-and-set on a hash field. `expected == None` means the field
    /// must be absent. Returns whether the swap happened.
    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool>;

    // ------------------------------------------------------------------
    // Sorted sets (delayed work, LRU accounting)
    // ------------------------------------------------------------------

    /// Add or update a member with the given score.
    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Atomically remove and return the earliest member whose score is
    /// `<= max_score`, together with its score.
    async fn zset_pop_due(&self, key: &str, max_score: i64) -> Result<Option<(String, i64)>>;

    /// The smallest score present, if any.
    async fn zset_peek_score(&self, key: &str) -> Result<Option<i64>>;

    /// Members in ascending score order, `start..=stop` by rank.
    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn zset_remove(&self, key: &str, member: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Plain keys and claims
    // ------------------------------------------------------------------

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` only if absent, with an auto-expiring TTL. Returns whether
    /// the claim was acquired. This is the idempotence sentinel primitive.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Refresh the TTL of a key (lists and hashes included).
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. Messages published before the subscription
    /// are not replayed.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}
