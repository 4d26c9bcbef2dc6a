//! Typed access to the request-state database.
//!
//! The broker is the only shared mutable state between services; this module
//! gives the ingress, scheduler, and executor one vocabulary over the
//! `request:<id>` hash and its queues: node-state transitions (with a
//! compare-and-set guard so a node is enqueued at most once per activation),
//! readiness checks, response appends, cancellation, and TTL refresh.

use crate::keys::{self, fields};
use crate::{Broker, BrokerHandle, QueueEntry, Result};
use dfm::fingerprint::Fingerprint;
use dfm::pipeline::{InputSource, Node, NodeId};
use dfm::registry::{ApiRegistry, Arity};
use dfm::request::{NodeState, RequestId, RequestRecord, Response};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared, clonable handle over the broker for request-state operations.
#[derive(Clone)]
pub struct RequestStore {
    broker: BrokerHandle,
    ttl: Duration,
}

impl RequestStore {
    pub fn new(broker: BrokerHandle, ttl: Duration) -> Self {
        Self { broker, ttl }
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    // ------------------------------------------------------------------
    // Record lifecycle
    // ------------------------------------------------------------------

    /// Persist a fresh request: the record JSON, every node PENDING, and the
    /// fingerprints computed at submission.
    pub async fn create(
        &self,
        record: &RequestRecord,
        fingerprints: &BTreeMap<NodeId, Fingerprint>,
    ) -> Result<()> {
        let key = keys::request(&record.request_id);
        let mut entries = vec![(
            fields::RECORD.to_string(),
            serde_json::to_string(record)?,
        )];
        for node in &record.pipeline.nodes {
            entries.push((
                fields::state(&node.node_id),
                NodeState::Pending.as_str().to_string(),
            ));
            if let Some(fp) = fingerprints.get(&node.node_id) {
                entries.push((fields::fingerprint(&node.node_id), fp.to_string()));
            }
        }
        self.broker.hash_set_multiple(&key, &entries).await?;
        self.refresh_ttl(&record.request_id).await?;
        Ok(())
    }

    pub async fn load(&self, id: &RequestId) -> Result<Option<RequestRecord>> {
        let raw = self
            .broker
            .hash_get(&keys::request(id), fields::RECORD)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, id: &RequestId) -> Result<bool> {
        self.broker.exists(&keys::request(id)).await
    }

    /// Refresh the record and response-queue TTLs while the request is live.
    pub async fn refresh_ttl(&self, id: &RequestId) -> Result<()> {
        self.broker.expire(&keys::request(id), self.ttl).await?;
        self.broker.expire(&keys::response(id), self.ttl).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node state
    // ------------------------------------------------------------------

    pub async fn node_state(&self, id: &RequestId, node: &NodeId) -> Result<Option<NodeState>> {
        let raw = self
            .broker
            .hash_get(&keys::request(id), &fields::state(node))
            .await?;
        Ok(raw.and_then(|raw| raw.parse().ok()))
    }

    pub async fn set_node_state(
        &self,
        id: &RequestId,
        node: &NodeId,
        state: NodeState,
    ) -> Result<()> {
        self.broker
            .hash_set(&keys::request(id), &fields::state(node), state.as_str())
            .await
    }

    /// Transition `from -> to` atomically; returns whether this caller won.
    pub async fn transition_if(
        &self,
        id: &RequestId,
        node: &NodeId,
        from: NodeState,
        to: NodeState,
    ) -> Result<bool> {
        self.broker
            .hash_compare_and_set(
                &keys::request(id),
                &fields::state(node),
                Some(from.as_str()),
                to.as_str(),
            )
            .await
    }

    /// Whether every node of the pipeline is in a terminal state.
    pub async fn all_terminal(&self, record: &RequestRecord) -> Result<bool> {
        for node in &record.pipeline.nodes {
            let state = self
                .node_state(&record.request_id, &node.node_id)
                .await?
                .unwrap_or(NodeState::Pending);
            if !state.is_terminal() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Fingerprints, continuations, port markers
    // ------------------------------------------------------------------

    pub async fn fingerprint(&self, id: &RequestId, node: &NodeId) -> Result<Option<Fingerprint>> {
        let raw = self
            .broker
            .hash_get(&keys::request(id), &fields::fingerprint(node))
            .await?;
        Ok(raw.and_then(|raw| raw.parse().ok()))
    }

    pub async fn continuation(&self, id: &RequestId, node: &NodeId) -> Result<Option<Value>> {
        let raw = self
            .broker
            .hash_get(&keys::request(id), &fields::continuation(node))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_continuation(
        &self,
        id: &RequestId,
        node: &NodeId,
        continuation: &Value,
    ) -> Result<()> {
        self.broker
            .hash_set(
                &keys::request(id),
                &fields::continuation(node),
                &serde_json::to_string(continuation)?,
            )
            .await
    }

    pub async fn clear_continuation(&self, id: &RequestId, node: &NodeId) -> Result<()> {
        self.broker
            .hash_del(&keys::request(id), &fields::continuation(node))
            .await
    }

    pub async fn mark_port_closed(
        &self,
        id: &RequestId,
        node: &NodeId,
        port: usize,
    ) -> Result<()> {
        self.broker
            .hash_set(&keys::request(id), &fields::port_closed(node, port), "1")
            .await
    }

    pub async fn is_port_closed(
        &self,
        id: &RequestId,
        node: &NodeId,
        port: usize,
    ) -> Result<bool> {
        Ok(self
            .broker
            .hash_get(&keys::request(id), &fields::port_closed(node, port))
            .await?
            .as_deref()
            == Some("1"))
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    pub async fn push_response(&self, response: &Response) -> Result<()> {
        self.broker
            .push_back(
                &keys::response(&response.request_id),
                &serde_json::to_string(response)?,
            )
            .await
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    pub async fn is_cancelled(&self, id: &RequestId) -> Result<bool> {
        Ok(self
            .broker
            .hash_get(&keys::request(id), fields::CANCELLED)
            .await?
            .as_deref()
            == Some("1"))
    }

    /// Flag the request cancelled and drain PENDING/READY nodes to
    /// CANCELLED. RUNNING nodes observe the flag at their next poll.
    /// Idempotent: only the first call does any work.
    pub async fn cancel(&self, record: &RequestRecord) -> Result<bool> {
        let first = self
            .broker
            .hash_compare_and_set(
                &keys::request(&record.request_id),
                fields::CANCELLED,
                None,
                "1",
            )
            .await?;
        if !first {
            return Ok(false);
        }

        for node in &record.pipeline.nodes {
            let id = &record.request_id;
            for from in [NodeState::Pending, NodeState::Ready] {
                if self
                    .transition_if(id, &node.node_id, from, NodeState::Cancelled)
                    .await?
                {
                    self.push_response(&Response::status(
                        id.clone(),
                        node.node_id.clone(),
                        NodeState::Cancelled,
                    ))
                    .await?;
                    break;
                }
            }
        }
        debug!("request {} cancelled", record.request_id);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Queues and readiness
    // ------------------------------------------------------------------

    pub async fn enqueue_exec(&self, entry: &QueueEntry) -> Result<()> {
        self.broker
            .push_back(keys::EXEC_QUEUE, &entry.encode()?)
            .await
    }

    /// Park an entry on the delayed queue and wake the scheduler.
    pub async fn enqueue_delayed(&self, entry: &QueueEntry, due_ms: i64) -> Result<()> {
        self.broker
            .zset_add(keys::SCHED_DELAYED, &entry.encode()?, due_ms)
            .await?;
        self.broker.publish(keys::SCHED_WAKE, "wake").await
    }

    /// Whether a node's inputs allow it to make progress.
    ///
    /// Nullary nodes are always input-ready; a unary node once its upstream
    /// has produced a first value or closed; a variadic node once every
    /// upstream port has closed. Literal inputs count as closed ports with a
    /// value present.
    pub async fn node_input_ready(
        &self,
        id: &RequestId,
        node: &Node,
        registry: &ApiRegistry,
    ) -> Result<bool> {
        let arity = registry
            .get(&node.api_class)
            .map(|d| d.arity)
            .unwrap_or(Arity::Variadic);

        match arity {
            Arity::Nullary => Ok(true),
            Arity::Unary => match node.inputs.first() {
                None | Some(InputSource::Literal { .. }) => Ok(true),
                Some(InputSource::Node(_)) => {
                    let buffered = self
                        .broker
                        .list_len(&keys::input(id, &node.node_id, 0))
                        .await?;
                    Ok(buffered > 0 || self.is_port_closed(id, &node.node_id, 0).await?)
                }
            },
            Arity::Variadic => {
                for (port, input) in node.inputs.iter().enumerate() {
                    if matches!(input, InputSource::Node(_))
                        && !self.is_port_closed(id, &node.node_id, port).await?
                    {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Enqueue a node if it is eligible: `after` targets all COMPLETED,
    /// inputs ready, `not_before` reached, and the PENDING -> READY
    /// transition won. An otherwise-eligible node whose `not_before` is
    /// still in the future is parked on the delayed queue instead; the
    /// scheduler promotes it when due. Returns whether the node was enqueued
    /// onto the execution queue by this call.
    pub async fn try_enqueue_ready(
        &self,
        record: &RequestRecord,
        node: &Node,
        registry: &ApiRegistry,
    ) -> Result<bool> {
        let id = &record.request_id;

        for target in &node.after {
            let state = self.node_state(id, target).await?;
            if state != Some(NodeState::Completed) {
                return Ok(false);
            }
        }

        if !self.node_input_ready(id, node, registry).await? {
            return Ok(false);
        }

        // Checked after `after`/inputs: a node only reaches the delayed
        // queue once every other constraint holds, and those are monotone,
        // so the scheduler's promotion needs no pipeline knowledge.
        // Re-parking is idempotent: same member, same score.
        if let Some(not_before) = node.not_before {
            if not_before > chrono::Utc::now() {
                self.enqueue_delayed(
                    &QueueEntry::new(id.clone(), node.node_id.clone()),
                    not_before.timestamp_millis(),
                )
                .await?;
                debug!(
                    "node {}/{} parked until {not_before}",
                    id, node.node_id
                );
                return Ok(false);
            }
        }

        if !self
            .transition_if(id, &node.node_id, NodeState::Pending, NodeState::Ready)
            .await?
        {
            return Ok(false);
        }

        self.push_response(&Response::status(
            id.clone(),
            node.node_id.clone(),
            NodeState::Ready,
        ))
        .await?;
        self.enqueue_exec(&QueueEntry::new(id.clone(), node.node_id.clone()))
            .await?;
        debug!("node {}/{} enqueued", id, node.node_id);
        Ok(true)
    }
}

/// Build a store over a broker with the default TTL.
pub fn request_store(broker: Arc<dyn Broker>) -> RequestStore {
    RequestStore::new(broker, dfm::config::DEFAULT_REQUEST_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBroker;
    use dfm::pipeline::{Node, Pipeline};
    use dfm::registry::api;
    use serde_json::json;

    fn store() -> RequestStore {
        request_store(Arc::new(MemoryBroker::new()))
    }

    fn record(nodes: Vec<Node>) -> RequestRecord {
        RequestRecord {
            request_id: RequestId::generate(),
            pipeline: Pipeline::new(nodes),
            aliases: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_load_roundtrip() {
        let store = store();
        let record = record(vec![
            Node::new("c", api::CONSTANT).with_params(json!({"value": 1}))
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();

        assert!(store.exists(&record.request_id).await.unwrap());
        let loaded = store.load(&record.request_id).await.unwrap().unwrap();
        assert_eq!(loaded.pipeline, record.pipeline);
        assert_eq!(
            store
                .node_state(&record.request_id, &"c".into())
                .await
                .unwrap(),
            Some(NodeState::Pending)
        );
    }

    #[tokio::test]
    async fn test_load_missing_request() {
        let store = store();
        assert!(store.load(&"ghost".into()).await.unwrap().is_none());
        assert!(!store.exists(&"ghost".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_guard() {
        let store = store();
        let record = record(vec![
            Node::new("c", api::CONSTANT).with_params(json!({"value": 1}))
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();
        let id = &record.request_id;

        assert!(store
            .transition_if(id, &"c".into(), NodeState::Pending, NodeState::Ready)
            .await
            .unwrap());
        // Second claim loses.
        assert!(!store
            .transition_if(id, &"c".into(), NodeState::Pending, NodeState::Ready)
            .await
            .unwrap());
        assert_eq!(
            store.node_state(id, &"c".into()).await.unwrap(),
            Some(NodeState::Ready)
        );
    }

    #[tokio::test]
    async fn test_continuation_roundtrip() {
        let store = store();
        let record = record(vec![
            Node::new("d", api::DELAY).with_params(json!({"seconds": 1, "value": 5}))
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();
        let id = &record.request_id;

        assert!(store.continuation(id, &"d".into()).await.unwrap().is_none());
        store
            .set_continuation(id, &"d".into(), &json!({"armed": true}))
            .await
            .unwrap();
        assert_eq!(
            store.continuation(id, &"d".into()).await.unwrap(),
            Some(json!({"armed": true}))
        );
        store.clear_continuation(id, &"d".into()).await.unwrap();
        assert!(store.continuation(id, &"d".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_drains_pending_and_is_idempotent() {
        let store = store();
        let record = record(vec![
            Node::new("a", api::CONSTANT).with_params(json!({"value": 1})),
            Node::new("b", api::CONSTANT).with_params(json!({"value": 2})),
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();

        assert!(store.cancel(&record).await.unwrap());
        assert!(!store.cancel(&record).await.unwrap());
        assert!(store.is_cancelled(&record.request_id).await.unwrap());

        for node in ["a", "b"] {
            assert_eq!(
                store
                    .node_state(&record.request_id, &node.into())
                    .await
                    .unwrap(),
                Some(NodeState::Cancelled)
            );
        }
    }

    #[tokio::test]
    async fn test_cancel_leaves_running_nodes_to_workers() {
        let store = store();
        let record = record(vec![
            Node::new("a", api::CONSTANT).with_params(json!({"value": 1}))
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();
        store
            .set_node_state(&record.request_id, &"a".into(), NodeState::Running)
            .await
            .unwrap();

        store.cancel(&record).await.unwrap();
        assert_eq!(
            store
                .node_state(&record.request_id, &"a".into())
                .await
                .unwrap(),
            Some(NodeState::Running)
        );
    }

    #[tokio::test]
    async fn test_try_enqueue_ready_nullary() {
        let store = store();
        let registry = ApiRegistry::builtin();
        let record = record(vec![
            Node::new("c", api::CONSTANT).with_params(json!({"value": 1}))
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let node = record.pipeline.node(&"c".into()).unwrap();
        assert!(store
            .try_enqueue_ready(&record, node, &registry)
            .await
            .unwrap());
        // Already READY: no duplicate enqueue.
        assert!(!store
            .try_enqueue_ready(&record, node, &registry)
            .await
            .unwrap());

        let raw = store
            .broker()
            .pop_front(keys::EXEC_QUEUE)
            .await
            .unwrap()
            .unwrap();
        let entry = QueueEntry::decode(&raw).unwrap();
        assert_eq!(entry.node_id, "c".into());
    }

    #[tokio::test]
    async fn test_try_enqueue_waits_for_after_targets() {
        let store = store();
        let registry = ApiRegistry::builtin();
        let record = record(vec![
            Node::new("a", api::CONSTANT).with_params(json!({"value": 1})),
            Node::new("sig", api::SIGNAL_CLIENT)
                .with_params(json!({"message": "m"}))
                .with_after(["a"]),
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let sig = record.pipeline.node(&"sig".into()).unwrap();
        assert!(!store
            .try_enqueue_ready(&record, sig, &registry)
            .await
            .unwrap());

        store
            .set_node_state(&record.request_id, &"a".into(), NodeState::Completed)
            .await
            .unwrap();
        assert!(store
            .try_enqueue_ready(&record, sig, &registry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_future_not_before_parks_to_delayed() {
        let store = store();
        let registry = ApiRegistry::builtin();
        let not_before = chrono::Utc::now() + chrono::Duration::seconds(60);
        let record = record(vec![Node::new("late", api::CONSTANT)
            .with_params(json!({"value": 1}))
            .with_not_before(not_before)]);
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let node = record.pipeline.node(&"late".into()).unwrap();
        assert!(!store
            .try_enqueue_ready(&record, node, &registry)
            .await
            .unwrap());

        // Parked, not executed: no exec entry, one delayed entry scored at
        // the deadline, state still PENDING.
        assert_eq!(store.broker().list_len(keys::EXEC_QUEUE).await.unwrap(), 0);
        assert_eq!(
            store
                .broker()
                .zset_peek_score(keys::SCHED_DELAYED)
                .await
                .unwrap(),
            Some(not_before.timestamp_millis())
        );
        assert_eq!(
            store
                .node_state(&record.request_id, &"late".into())
                .await
                .unwrap(),
            Some(NodeState::Pending)
        );

        // Re-parking leaves a single delayed entry behind.
        assert!(!store
            .try_enqueue_ready(&record, node, &registry)
            .await
            .unwrap());
        assert_eq!(
            store
                .broker()
                .zset_range(keys::SCHED_DELAYED, 0, -1)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_past_not_before_enqueues_normally() {
        let store = store();
        let registry = ApiRegistry::builtin();
        let record = record(vec![Node::new("c", api::CONSTANT)
            .with_params(json!({"value": 1}))
            .with_not_before(chrono::Utc::now() - chrono::Duration::seconds(5))]);
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let node = record.pipeline.node(&"c".into()).unwrap();
        assert!(store
            .try_enqueue_ready(&record, node, &registry)
            .await
            .unwrap());
        assert_eq!(store.broker().list_len(keys::EXEC_QUEUE).await.unwrap(), 1);
        assert!(store
            .broker()
            .zset_peek_score(keys::SCHED_DELAYED)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_not_before_waits_for_after_targets() {
        // A node carrying both constraints is not parked while its `after`
        // set is open: only an otherwise-eligible node reaches the delayed
        // queue.
        let store = store();
        let registry = ApiRegistry::builtin();
        let record = record(vec![
            Node::new("a", api::CONSTANT).with_params(json!({"value": 1})),
            Node::new("b", api::SIGNAL_CLIENT)
                .with_params(json!({"message": "go"}))
                .with_after(["a"])
                .with_not_before(chrono::Utc::now() + chrono::Duration::seconds(60)),
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let b = record.pipeline.node(&"b".into()).unwrap();
        assert!(!store.try_enqueue_ready(&record, b, &registry).await.unwrap());
        assert!(store
            .broker()
            .zset_peek_score(keys::SCHED_DELAYED)
            .await
            .unwrap()
            .is_none());

        store
            .set_node_state(&record.request_id, &"a".into(), NodeState::Completed)
            .await
            .unwrap();
        assert!(!store.try_enqueue_ready(&record, b, &registry).await.unwrap());
        assert!(store
            .broker()
            .zset_peek_score(keys::SCHED_DELAYED)
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.broker().list_len(keys::EXEC_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unary_readiness_first_value_or_close() {
        let store = store();
        let registry = ApiRegistry::builtin();
        let record = record(vec![
            Node::new("up", api::CONSTANT).with_params(json!({"value": 1})),
            Node::new("sq", api::EVAL_EXPR)
                .with_params(json!({"expression": "x * x"}))
                .with_inputs(["up"]),
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();
        let id = &record.request_id;
        let sq = record.pipeline.node(&"sq".into()).unwrap();

        assert!(!store.node_input_ready(id, sq, &registry).await.unwrap());

        // First buffered value makes a unary node ready.
        store
            .broker()
            .push_back(&keys::input(id, &"sq".into(), 0), "{\"value\": 1}")
            .await
            .unwrap();
        assert!(store.node_input_ready(id, sq, &registry).await.unwrap());
    }

    #[tokio::test]
    async fn test_unary_readiness_on_close_without_values() {
        let store = store();
        let registry = ApiRegistry::builtin();
        let record = record(vec![
            Node::new("up", api::CONSTANT).with_params(json!({"value": 1})),
            Node::new("sq", api::EVAL_EXPR)
                .with_params(json!({"expression": "x * x"}))
                .with_inputs(["up"]),
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();
        let id = &record.request_id;
        let sq = record.pipeline.node(&"sq".into()).unwrap();

        store.mark_port_closed(id, &"sq".into(), 0).await.unwrap();
        assert!(store.node_input_ready(id, sq, &registry).await.unwrap());
    }

    #[tokio::test]
    async fn test_variadic_readiness_needs_all_ports_closed() {
        let store = store();
        let registry = ApiRegistry::builtin();
        let record = record(vec![
            Node::new("a", api::CONSTANT).with_params(json!({"value": 1})),
            Node::new("b", api::CONSTANT).with_params(json!({"value": 2})),
            Node::new("m", api::MERGE).with_inputs(["a", "b"]),
        ]);
        store.create(&record, &BTreeMap::new()).await.unwrap();
        let id = &record.request_id;
        let m = record.pipeline.node(&"m".into()).unwrap();

        assert!(!store.node_input_ready(id, m, &registry).await.unwrap());
        store.mark_port_closed(id, &"m".into(), 0).await.unwrap();
        assert!(!store.node_input_ready(id, m, &registry).await.unwrap());
        store.mark_port_closed(id, &"m".into(), 1).await.unwrap();
        assert!(store.node_input_ready(id, m, &registry).await.unwrap());
    }

    #[tokio::test]
    async fn test_response_queue_order() {
        let store = store();
        let id: RequestId = "r".into();
        store
            .push_response(&Response::status(id.clone(), "n".into(), NodeState::Ready))
            .await
            .unwrap();
        store
            .push_response(&Response::value(id.clone(), "n".into(), json!(1)))
            .await
            .unwrap();

        let raw = store
            .broker()
            .list_range(&keys::response(&id), 0, -1)
            .await
            .unwrap();
        assert_eq!(raw.len(), 2);
        let first: Response = serde_json::from_str(&raw[0]).unwrap();
        assert_eq!(first.state(), Some(NodeState::Ready));
    }
}
