//! The adapter contract: the extension seam of the execution service.
//!
//! An adapter is the implementation of one api class within one provider. It
//! is handed an [`AdapterContext`] per node activation and returns a lazy
//! stream of values; the worker drains the stream, persisting and routing
//! each value. Adapters never touch the broker keyspace directly: everything
//! they are allowed to do goes through the context.

use dfm::error::{DfmError, Result};
use dfm::pipeline::NodeId;
use dfm::registry::Arity;
use dfm::request::{RequestId, Response};
use dfm_broker::{QueueEntry, RequestStore};
use dfm_cache::BlobStore;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The value plane: a lazy, bounded-or-unbounded sequence of typed values.
pub type ValueStream = BoxStream<'static, Result<Value>>;

/// A provider namespace as the executor sees it at run time: its name plus
/// the blob store its `cache_fsspec_conf` describes.
#[derive(Clone)]
pub struct ProviderRuntime {
    pub name: String,
    pub description: String,
    pub blobs: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for ProviderRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRuntime")
            .field("name", &self.name)
            .finish()
    }
}

/// Everything one node activation may see and do.
///
/// This is the `DfmRequest` handle of the adapter contract: it writes client
/// responses, schedules follow-up activations, and carries the adapter-owned
/// continuation blob across them.
pub struct AdapterContext {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub provider: ProviderRuntime,
    /// The node's validated parameter record.
    pub params: Value,
    store: RequestStore,
    inputs: parking_lot::Mutex<Vec<ValueStream>>,
    continuation: Option<Value>,
    pending_continuation: parking_lot::Mutex<Option<Value>>,
    deferred: AtomicBool,
}

impl AdapterContext {
    pub fn new(
        request_id: RequestId,
        node_id: NodeId,
        provider: ProviderRuntime,
        params: Value,
        store: RequestStore,
        inputs: Vec<ValueStream>,
        continuation: Option<Value>,
    ) -> Self {
        Self {
            request_id,
            node_id,
            provider,
            params,
            store,
            inputs: parking_lot::Mutex::new(inputs),
            continuation,
            pending_continuation: parking_lot::Mutex::new(None),
            deferred: AtomicBool::new(false),
        }
    }

    /// Deserialize the node's params into the adapter's parameter struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            DfmError::AdapterBadInput(format!(
                "node '{}': cannot read params: {e}",
                self.node_id
            ))
        })
    }

    /// Take all upstream streams, in port order. Each stream may be taken
    /// once per activation.
    pub fn take_inputs(&self) -> Vec<ValueStream> {
        std::mem::take(&mut *self.inputs.lock())
    }

    /// Take the single upstream stream of a unary adapter.
    pub fn take_input(&self) -> Result<ValueStream> {
        self.take_inputs().into_iter().next().ok_or_else(|| {
            DfmError::Internal(format!(
                "node '{}': unary adapter has no upstream stream",
                self.node_id
            ))
        })
    }

    /// Append a `ValueResponse` straight to the client response queue,
    /// independent of the node's `is_output` routing.
    pub async fn send_value_response(&self, value: Value) -> Result<()> {
        self.store
            .push_response(&Response::value(
                self.request_id.clone(),
                self.node_id.clone(),
                value,
            ))
            .await?;
        Ok(())
    }

    /// Park this node on the delayed queue and return without completing.
    ///
    /// The current activation's stream should end after this call; the
    /// scheduler re-enqueues the node once `delay` has elapsed, and the next
    /// activation sees the continuation stored via [`set_continuation`].
    ///
    /// [`set_continuation`]: AdapterContext::set_continuation
    pub async fn schedule_after(&self, delay: Duration) -> Result<()> {
        let due_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.store
            .enqueue_delayed(
                &QueueEntry::new(self.request_id.clone(), self.node_id.clone()),
                due_ms,
            )
            .await?;
        self.deferred.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The continuation persisted by the previous activation, if any.
    pub fn continuation(&self) -> Option<&Value> {
        self.continuation.as_ref()
    }

    /// Persist an opaque continuation blob for the next activation.
    pub fn set_continuation(&self, continuation: Value) {
        *self.pending_continuation.lock() = Some(continuation);
    }

    /// Whether this activation deferred itself via [`schedule_after`].
    ///
    /// [`schedule_after`]: AdapterContext::schedule_after
    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    pub(crate) fn take_pending_continuation(&self) -> Option<Value> {
        self.pending_continuation.lock().take()
    }
}

/// The pluggable implementation of one api class.
///
/// Implementations are built once at startup from their binding's static
/// config (site YAML) and invoked per node activation. `body()` is the only
/// required operation; it may await external I/O freely. Side effects should
/// be idempotent: a node can be retried after transient failures.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// How many upstream streams `body()` consumes. Checked against the
    /// node's declared inputs at dispatch-table build time.
    fn arity(&self) -> Arity;

    /// Per-node soft timeout override, when the binding config carries one.
    fn soft_timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether produced values may be served from the cache. Adapters whose
    /// point is a side effect (not their yielded values) return false so a
    /// cache hit cannot swallow the effect.
    fn cacheable(&self) -> bool {
        true
    }

    /// The lazy producer. Yielding an `Err` fails the node (subject to the
    /// retry policy of the error's kind).
    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream>;
}
