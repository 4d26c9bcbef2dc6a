//! The worker pool and the node lifecycle state machine.
//!
//! Each worker is a cooperative task pulling entries off `exec:queue`:
//! claim the node, resolve its adapter, replay the cache or drain the
//! adapter's stream, route every value (cache, response queue, downstream
//! input buffers), then propagate readiness or failure to dependents.

use crate::adapter::{Adapter, AdapterContext, ProviderRuntime};
use crate::dispatch::AdapterRegistry;
use crate::heartbeat::{HousekeepingConfig, HousekeepingManager};
use crate::streams::{close_consumer_ports, deliver_to_consumers, node_input_streams};
use dfm::error::{DfmError, ErrorKind, Result};
use dfm::fingerprint::Fingerprint;
use dfm::optimize::pipeline_fingerprints;
use dfm::pipeline::Node;
use dfm::registry::ApiRegistry;
use dfm::request::{NodeState, RequestRecord, Response};
use dfm_broker::{keys, QueueEntry, RequestStore};
use dfm_cache::{CacheConfig, CacheRead, ValueCache};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, error, info, warn};

/// Tuning knobs of one execution service.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker-pool size.
    pub workers: usize,
    /// BLPOP bound on the execution queue.
    pub queue_poll: Duration,
    /// Default per-node soft timeout; adapters may override.
    pub node_timeout: Duration,
    /// Cancellation-flag check granularity while an adapter streams.
    pub cancellation_poll: Duration,
    /// Retry budget for `UPSTREAM_UNAVAILABLE` adapter failures.
    pub upstream_retries: usize,
    /// Base delay of the exponential backoff between retries.
    pub retry_base_delay: Duration,
    pub housekeeping: HousekeepingConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
            queue_poll: Duration::from_secs(1),
            node_timeout: Duration::from_secs(10 * 60),
            cancellation_poll: Duration::from_millis(500),
            upstream_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            housekeeping: HousekeepingConfig::default(),
        }
    }
}

/// Exponential backoff with jitter, starting from `base`.
fn backoff(base: Duration) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(base.as_millis().max(2) as u64)
        .max_delay(Duration::from_secs(30))
        .map(jitter)
}

enum RunOutcome {
    Completed,
    Deferred,
}

/// The execution service. [`Executor::spawn`] starts the worker pool and
/// returns a handle for graceful shutdown.
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    store: RequestStore,
    registry: Arc<ApiRegistry>,
    dispatch: Arc<AdapterRegistry>,
    caches: HashMap<String, ValueCache>,
    housekeeping: Arc<HousekeepingManager>,
    config: ExecutorConfig,
}

/// Handle over a running worker pool.
pub struct ExecutorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    housekeeping: Arc<HousekeepingManager>,
}

impl ExecutorHandle {
    /// Stop pulling work, wait for in-flight nodes, abort housekeeping.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        self.housekeeping.shutdown();
    }
}

impl Executor {
    pub fn new(
        store: RequestStore,
        registry: Arc<ApiRegistry>,
        dispatch: AdapterRegistry,
        cache_config: CacheConfig,
        config: ExecutorConfig,
    ) -> Self {
        let dispatch = Arc::new(dispatch);
        let caches = dispatch
            .providers()
            .map(|provider| {
                (
                    provider.name.clone(),
                    ValueCache::new(
                        store.broker().clone(),
                        provider.blobs.clone(),
                        cache_config.clone(),
                    ),
                )
            })
            .collect();

        let housekeeping = HousekeepingManager::new(store.clone(), config.housekeeping.clone());

        Self {
            inner: Arc::new(ExecutorInner {
                store,
                registry,
                dispatch,
                caches,
                housekeeping,
                config,
            }),
        }
    }

    /// Start the worker pool.
    pub fn spawn(self) -> ExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = (0..self.inner.config.workers)
            .map(|worker_id| {
                let inner = Arc::clone(&self.inner);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { worker_loop(inner, shutdown, worker_id).await })
            })
            .collect();

        info!("executor started with {} workers", self.inner.config.workers);

        ExecutorHandle {
            shutdown: shutdown_tx,
            workers,
            housekeeping: Arc::clone(&self.inner.housekeeping),
        }
    }
}

async fn worker_loop(
    inner: Arc<ExecutorInner>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: usize,
) {
    let mut broker_backoff = backoff(inner.config.retry_base_delay);
    loop {
        if *shutdown.borrow() {
            break;
        }

        let popped = tokio::select! {
            popped = inner
                .store
                .broker()
                .blocking_pop_front(keys::EXEC_QUEUE, inner.config.queue_poll) => popped,
            _ = shutdown.changed() => break,
        };

        match popped {
            Ok(None) => continue,
            Ok(Some(raw)) => {
                broker_backoff = backoff(inner.config.retry_base_delay);
                let entry = match QueueEntry::decode(&raw) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("worker {worker_id}: dropping malformed queue entry: {e}");
                        continue;
                    }
                };
                if let Err(e) = inner.run_node(&entry).await {
                    error!(
                        "worker {worker_id}: node {}/{} failed outside the adapter: {e}",
                        entry.request_id, entry.node_id
                    );
                }
            }
            Err(e) => {
                let delay = broker_backoff.next().unwrap_or(Duration::from_secs(30));
                warn!("worker {worker_id}: broker unavailable ({e}); retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
    debug!("worker {worker_id} stopped");
}

impl ExecutorInner {
    async fn run_node(&self, entry: &QueueEntry) -> Result<()> {
        let id = &entry.request_id;
        let Some(record) = self.store.load(id).await? else {
            warn!("request {id} vanished before node {} ran", entry.node_id);
            return Ok(());
        };
        let Some(node) = record.pipeline.node(&entry.node_id) else {
            warn!("request {id} has no node '{}'", entry.node_id);
            return Ok(());
        };

        // Queued entries of a cancelled request are drained on pick.
        if self.store.is_cancelled(id).await? {
            let state = self
                .store
                .node_state(id, &node.node_id)
                .await?
                .unwrap_or(NodeState::Pending);
            if !state.is_terminal() {
                self.store
                    .set_node_state(id, &node.node_id, NodeState::Cancelled)
                    .await?;
                self.store
                    .push_response(&Response::status(
                        id.clone(),
                        node.node_id.clone(),
                        NodeState::Cancelled,
                    ))
                    .await?;
            }
            return Ok(());
        }

        let state = self
            .store
            .node_state(id, &node.node_id)
            .await?
            .unwrap_or(NodeState::Pending);
        if state.is_terminal() {
            return Ok(());
        }

        // Liveness claim: guards against duplicate deliveries while this
        // worker is alive and expires with the process, so a crashed run is
        // reclaimed by the housekeeping pass.
        let claim_key = keys::exec_claim(id, &node.node_id);
        let claim_ttl = self.config.node_timeout + Duration::from_secs(120);
        if !self
            .store
            .broker()
            .set_nx_ex(&claim_key, "1", claim_ttl)
            .await?
        {
            debug!("node {}/{} is already claimed", id, node.node_id);
            return Ok(());
        }

        let outcome = self.run_claimed(&record, node).await;
        let _ = self.store.broker().delete(&claim_key).await;
        outcome
    }

    async fn run_claimed(&self, record: &RequestRecord, node: &Node) -> Result<()> {
        let id = &record.request_id;
        self.housekeeping.ensure_started(record);

        self.store
            .set_node_state(id, &node.node_id, NodeState::Running)
            .await?;
        self.store
            .push_response(&Response::status(
                id.clone(),
                node.node_id.clone(),
                NodeState::Running,
            ))
            .await?;

        match self.execute(record, node).await {
            Ok(RunOutcome::Completed) => self.complete_node(record, node).await,
            Ok(RunOutcome::Deferred) => {
                // Back to PENDING; the scheduler re-enqueues when due.
                self.store
                    .set_node_state(id, &node.node_id, NodeState::Pending)
                    .await
                    .map_err(Into::into)
            }
            Err(e) => self.fail_node(record, node, e).await,
        }
    }

    async fn execute(&self, record: &RequestRecord, node: &Node) -> Result<RunOutcome> {
        let id = &record.request_id;

        let fp = match self.store.fingerprint(id, &node.node_id).await? {
            Some(fp) => fp,
            None => {
                // Fingerprints are filled at submission; recompute only if
                // the field is missing.
                let fps = pipeline_fingerprints(&record.pipeline)?;
                *fps.get(&node.node_id).ok_or_else(|| {
                    DfmError::Internal(format!("no fingerprint for node '{}'", node.node_id))
                })?
            }
        };

        let provider = self
            .dispatch
            .provider(&node.provider)
            .cloned()
            .ok_or_else(|| {
                DfmError::Internal(format!("provider '{}' is not configured", node.provider))
            })?;
        let cache = self.caches.get(&node.provider).ok_or_else(|| {
            DfmError::Internal(format!("no cache for provider '{}'", node.provider))
        })?;
        let adapter = self
            .dispatch
            .resolve(&node.provider, &node.api_class)
            .ok_or_else(|| {
                DfmError::Internal(format!(
                    "provider '{}' has no adapter for '{}'",
                    node.provider, node.api_class
                ))
            })?;

        let cacheable = adapter.cacheable();

        if !node.force_compute && cacheable {
            match cache.get(&fp).await? {
                CacheRead::Hit(values) => {
                    debug!("node {}/{} served from cache ({fp})", id, node.node_id);
                    self.emit_all(record, node, values).await?;
                    return Ok(RunOutcome::Completed);
                }
                CacheRead::Building => {
                    if let Some(values) = cache.wait_for_seal(&fp).await? {
                        self.emit_all(record, node, values).await?;
                        return Ok(RunOutcome::Completed);
                    }
                }
                CacheRead::Miss => {}
            }
        }

        let mut retries = backoff(self.config.retry_base_delay).take(self.config.upstream_retries);
        loop {
            match self
                .attempt(record, node, &fp, cache, &adapter, &provider, cacheable)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if matches!(e, DfmError::UpstreamUnavailable(_)) => {
                    let Some(delay) = retries.next() else {
                        return Err(e);
                    };
                    warn!(
                        "node {}/{} upstream unavailable; retrying in {delay:?}: {e}",
                        id, node.node_id
                    );
                    tokio::time::sleep(delay).await;
                    if self.store.is_cancelled(id).await? {
                        return Err(DfmError::Cancelled("request cancelled".to_string()));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        record: &RequestRecord,
        node: &Node,
        fp: &Fingerprint,
        cache: &ValueCache,
        adapter: &Arc<dyn Adapter>,
        provider: &ProviderRuntime,
        cacheable: bool,
    ) -> Result<RunOutcome> {
        let id = &record.request_id;

        // Producer election. force_compute skips reads but still publishes
        // results when the lock is free; losing the lock race falls back to
        // waiting on the winner (or recomputing uncached under force).
        let caching = if cacheable && cache.try_acquire_builder(fp).await? {
            cache.reset_unsealed(fp).await?;
            true
        } else if cacheable && !node.force_compute {
            if let Some(values) = cache.wait_for_seal(fp).await? {
                self.emit_all(record, node, values).await?;
                return Ok(RunOutcome::Completed);
            }
            if cache.try_acquire_builder(fp).await? {
                cache.reset_unsealed(fp).await?;
                true
            } else {
                false
            }
        } else {
            false
        };

        let continuation = self.store.continuation(id, &node.node_id).await?;
        let ctx = Arc::new(AdapterContext::new(
            id.clone(),
            node.node_id.clone(),
            provider.clone(),
            node.params.clone(),
            self.store.clone(),
            node_input_streams(self.store.broker(), id, node),
            continuation,
        ));

        let soft_timeout = adapter.soft_timeout().unwrap_or(self.config.node_timeout);
        let deadline = tokio::time::Instant::now() + soft_timeout;

        let mut stream = match adapter.body(Arc::clone(&ctx)).await {
            Ok(stream) => stream,
            Err(e) => {
                if caching {
                    let _ = cache.release_builder(fp).await;
                }
                return Err(e);
            }
        };

        let mut index: usize = 0;
        let outcome: Result<()> = loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        if caching {
                            if let Err(e) = cache.put(fp, index, &value).await {
                                break Err(e);
                            }
                        }
                        index += 1;
                        if let Err(e) = self.emit_value(record, node, &value).await {
                            break Err(e);
                        }
                        // A steadily-producing stream keeps resetting the
                        // poll timer, so re-check the flag in-band too.
                        if index % 64 == 0 {
                            match self.check_abort(record, node).await {
                                Ok(None) => {}
                                Ok(Some(reason)) => break Err(DfmError::Cancelled(reason)),
                                Err(e) => break Err(e),
                            }
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                _ = tokio::time::sleep(self.config.cancellation_poll) => {
                    match self.check_abort(record, node).await {
                        Ok(None) => {}
                        Ok(Some(reason)) => break Err(DfmError::Cancelled(reason)),
                        Err(e) => break Err(e),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(DfmError::Cancelled(format!(
                        "node '{}' exceeded its {soft_timeout:?} timeout",
                        node.node_id
                    )));
                }
            }
        };
        drop(stream);

        match outcome {
            Ok(()) if ctx.is_deferred() => {
                if let Some(continuation) = ctx.take_pending_continuation() {
                    self.store
                        .set_continuation(id, &node.node_id, &continuation)
                        .await?;
                }
                if caching {
                    cache.reset_unsealed(fp).await?;
                    cache.release_builder(fp).await?;
                }
                Ok(RunOutcome::Deferred)
            }
            Ok(()) => {
                if caching {
                    cache.seal(fp).await?;
                }
                Ok(RunOutcome::Completed)
            }
            Err(e) => {
                if caching {
                    let _ = cache.reset_unsealed(fp).await;
                    let _ = cache.release_builder(fp).await;
                }
                Err(e)
            }
        }
    }

    /// Whether this node's run must stop: request cancelled or the node
    /// itself transitioned away from RUNNING (cascade cancellation).
    async fn check_abort(&self, record: &RequestRecord, node: &Node) -> Result<Option<String>> {
        let id = &record.request_id;
        if self.store.is_cancelled(id).await? {
            return Ok(Some("request cancelled".to_string()));
        }
        match self.store.node_state(id, &node.node_id).await? {
            Some(NodeState::Running) | None => Ok(None),
            Some(other) => Ok(Some(format!("node moved to {other} during its run"))),
        }
    }

    async fn emit_all(&self, record: &RequestRecord, node: &Node, values: Vec<Value>) -> Result<()> {
        for value in values {
            self.emit_value(record, node, &value).await?;
        }
        Ok(())
    }

    /// Route one produced value: response queue when `is_output`, every
    /// consumer's input buffer always, and a readiness check for unary
    /// consumers that can now start streaming.
    async fn emit_value(&self, record: &RequestRecord, node: &Node, value: &Value) -> Result<()> {
        let id = &record.request_id;
        if node.is_output {
            self.store
                .push_response(&Response::value(
                    id.clone(),
                    node.node_id.clone(),
                    value.clone(),
                ))
                .await?;
        }
        deliver_to_consumers(&self.store, &record.pipeline, id, &node.node_id, value).await?;

        for (consumer_id, _) in record.pipeline.consumers(&node.node_id) {
            if let Some(consumer) = record.pipeline.node(&consumer_id) {
                self.store
                    .try_enqueue_ready(record, consumer, &self.registry)
                    .await?;
            }
        }
        Ok(())
    }

    async fn complete_node(&self, record: &RequestRecord, node: &Node) -> Result<()> {
        let id = &record.request_id;
        self.store
            .set_node_state(id, &node.node_id, NodeState::Completed)
            .await?;
        self.store.clear_continuation(id, &node.node_id).await?;
        self.store
            .push_response(&Response::status(
                id.clone(),
                node.node_id.clone(),
                NodeState::Completed,
            ))
            .await?;

        close_consumer_ports(&self.store, &record.pipeline, id, &node.node_id).await?;

        for (consumer_id, _) in record.pipeline.consumers(&node.node_id) {
            if let Some(consumer) = record.pipeline.node(&consumer_id) {
                self.store
                    .try_enqueue_ready(record, consumer, &self.registry)
                    .await?;
            }
        }
        for dependent_id in record.pipeline.after_dependents(&node.node_id) {
            if let Some(dependent) = record.pipeline.node(&dependent_id) {
                self.store
                    .try_enqueue_ready(record, dependent, &self.registry)
                    .await?;
            }
        }

        debug!("node {}/{} completed", id, node.node_id);
        Ok(())
    }

    /// Terminal failure: mark the node, surface the error, and cancel every
    /// transitive dependent. Siblings continue.
    async fn fail_node(&self, record: &RequestRecord, node: &Node, err: DfmError) -> Result<()> {
        let id = &record.request_id;

        if err.kind() == ErrorKind::Cancelled {
            let state = self
                .store
                .node_state(id, &node.node_id)
                .await?
                .unwrap_or(NodeState::Pending);
            if !state.is_terminal() {
                self.store
                    .set_node_state(id, &node.node_id, NodeState::Cancelled)
                    .await?;
                self.store
                    .push_response(&Response::status_with_message(
                        id.clone(),
                        node.node_id.clone(),
                        NodeState::Cancelled,
                        err.to_string(),
                    ))
                    .await?;
            }
        } else {
            warn!("node {}/{} failed: {err}", id, node.node_id);
            self.store
                .set_node_state(id, &node.node_id, NodeState::Failed)
                .await?;
            self.store
                .push_response(&Response::error(
                    id.clone(),
                    node.node_id.clone(),
                    err.kind(),
                    err.to_string(),
                ))
                .await?;
            self.store
                .push_response(&Response::status(
                    id.clone(),
                    node.node_id.clone(),
                    NodeState::Failed,
                ))
                .await?;
        }

        for dependent_id in record.pipeline.transitive_dependents(&node.node_id) {
            let state = self
                .store
                .node_state(id, &dependent_id)
                .await?
                .unwrap_or(NodeState::Pending);
            if state.is_terminal() {
                continue;
            }
            self.store
                .set_node_state(id, &dependent_id, NodeState::Cancelled)
                .await?;
            self.store
                .push_response(&Response::cascade_error(
                    id.clone(),
                    dependent_id.clone(),
                    node.node_id.clone(),
                    format!("cancelled because node '{}' did not complete", node.node_id),
                ))
                .await?;
            self.store
                .push_response(&Response::status(
                    id.clone(),
                    dependent_id,
                    NodeState::Cancelled,
                ))
                .await?;
        }

        Ok(())
    }
}
