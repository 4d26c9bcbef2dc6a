//! Per-request housekeeping: heartbeats, TTL refresh, and the hard timeout.
//!
//! One background task per request, not per node, to bound response-queue
//! pressure. The task starts when the executor first touches a request and
//! ends once every node is terminal.

use dashmap::DashMap;
use dfm::request::{NodeState, RequestId, RequestRecord, Response};
use dfm_broker::{keys, QueueEntry, RequestStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// Heartbeat cadence while the request is live.
    pub heartbeat_interval: Duration,
    /// Hard per-request timeout; the whole request is cancelled past it.
    pub request_timeout: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Registry of live housekeeping tasks, one per request.
pub struct HousekeepingManager {
    store: RequestStore,
    config: HousekeepingConfig,
    tasks: DashMap<RequestId, JoinHandle<()>>,
}

impl HousekeepingManager {
    pub fn new(store: RequestStore, config: HousekeepingConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            tasks: DashMap::new(),
        })
    }

    /// Start the request's housekeeping task if it is not running yet.
    pub fn ensure_started(self: &Arc<Self>, record: &RequestRecord) {
        let id = record.request_id.clone();
        self.tasks.entry(id).or_insert_with(|| {
            let manager = Arc::clone(self);
            let record = record.clone();
            tokio::spawn(async move { manager.run(record).await })
        });
    }

    /// Abort every task. Used on executor shutdown.
    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
    }

    async fn run(self: Arc<Self>, record: RequestRecord) {
        let id = record.request_id.clone();
        debug!("housekeeping started for request {id}");

        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;

            if let Err(e) = self.store.refresh_ttl(&id).await {
                warn!("cannot refresh TTL of request {id}: {e}");
            }

            let age = chrono::Utc::now() - record.created_at;
            if age.to_std().unwrap_or_default() >= self.config.request_timeout {
                warn!("request {id} exceeded the hard timeout; cancelling");
                if let Err(e) = self.store.cancel(&record).await {
                    warn!("cannot cancel timed-out request {id}: {e}");
                }
            }

            if let Err(e) = self.reclaim_orphans(&record).await {
                warn!("reclaim pass failed for request {id}: {e}");
            }

            match self.store.all_terminal(&record).await {
                Ok(true) => break,
                Ok(false) => {
                    if let Err(e) = self
                        .store
                        .push_response(&Response::heartbeat(id.clone()))
                        .await
                    {
                        warn!("cannot push heartbeat for request {id}: {e}");
                    }
                }
                Err(e) => warn!("cannot read node states of request {id}: {e}"),
            }
        }

        self.tasks.remove(&id);
        debug!("housekeeping finished for request {id}");
    }

    /// Re-enqueue RUNNING nodes whose worker claim has expired (process
    /// loss). The new attempt starts from scratch unless the node persisted
    /// a continuation.
    async fn reclaim_orphans(
        &self,
        record: &RequestRecord,
    ) -> std::result::Result<(), dfm::DfmError> {
        let id = &record.request_id;
        for node in &record.pipeline.nodes {
            let state = self.store.node_state(id, &node.node_id).await?;
            if state != Some(NodeState::Running) {
                continue;
            }
            let claim = keys::exec_claim(id, &node.node_id);
            if self.store.broker().exists(&claim).await? {
                continue;
            }
            // Claim gone but the node never went terminal: the worker died.
            if self
                .store
                .transition_if(id, &node.node_id, NodeState::Running, NodeState::Ready)
                .await?
            {
                warn!("reclaiming orphaned node {}/{}", id, node.node_id);
                self.store
                    .push_response(&Response::status(
                        id.clone(),
                        node.node_id.clone(),
                        NodeState::Ready,
                    ))
                    .await?;
                self.store
                    .enqueue_exec(&QueueEntry::new(id.clone(), node.node_id.clone()))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfm::pipeline::{Node, Pipeline};
    use dfm::registry::api;
    use dfm::request::NodeState;
    use dfm_broker::{keys, store::request_store, MemoryBroker};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record() -> RequestRecord {
        RequestRecord {
            request_id: RequestId::generate(),
            pipeline: Pipeline::new(vec![
                Node::new("a", api::CONSTANT).with_params(json!({"value": 1}))
            ]),
            aliases: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_heartbeats_flow_until_terminal() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let record = record();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let manager = HousekeepingManager::new(
            store.clone(),
            HousekeepingConfig {
                heartbeat_interval: Duration::from_millis(20),
                request_timeout: Duration::from_secs(60),
            },
        );
        manager.ensure_started(&record);

        tokio::time::sleep(Duration::from_millis(70)).await;
        let raw = store
            .broker()
            .list_range(&keys::response(&record.request_id), 0, -1)
            .await
            .unwrap();
        let heartbeats = raw
            .iter()
            .filter_map(|r| serde_json::from_str::<Response>(r).ok())
            .filter(Response::is_heartbeat)
            .count();
        assert!(heartbeats >= 2, "saw {heartbeats} heartbeats");

        // Terminal state stops the task.
        store
            .set_node_state(&record.request_id, &"a".into(), NodeState::Completed)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(manager.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_started_is_idempotent() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let record = record();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let manager = HousekeepingManager::new(store, HousekeepingConfig::default());
        manager.ensure_started(&record);
        manager.ensure_started(&record);
        assert_eq!(manager.tasks.len(), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_orphaned_running_node_is_reclaimed() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let record = record();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        // RUNNING with no worker claim: the state a crashed worker leaves.
        store
            .set_node_state(&record.request_id, &"a".into(), NodeState::Running)
            .await
            .unwrap();

        let manager = HousekeepingManager::new(
            store.clone(),
            HousekeepingConfig {
                heartbeat_interval: Duration::from_millis(20),
                request_timeout: Duration::from_secs(60),
            },
        );
        manager.ensure_started(&record);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            store
                .node_state(&record.request_id, &"a".into())
                .await
                .unwrap(),
            Some(NodeState::Ready)
        );
        assert_eq!(store.broker().list_len(keys::EXEC_QUEUE).await.unwrap(), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_claimed_running_node_is_left_alone() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let record = record();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        store
            .set_node_state(&record.request_id, &"a".into(), NodeState::Running)
            .await
            .unwrap();
        store
            .broker()
            .set_nx_ex(
                &keys::exec_claim(&record.request_id, &"a".into()),
                "1",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let manager = HousekeepingManager::new(
            store.clone(),
            HousekeepingConfig {
                heartbeat_interval: Duration::from_millis(20),
                request_timeout: Duration::from_secs(60),
            },
        );
        manager.ensure_started(&record);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            store
                .node_state(&record.request_id, &"a".into())
                .await
                .unwrap(),
            Some(NodeState::Running)
        );
        assert_eq!(store.broker().list_len(keys::EXEC_QUEUE).await.unwrap(), 0);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_hard_timeout_cancels_request() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let mut record = record();
        record.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let manager = HousekeepingManager::new(
            store.clone(),
            HousekeepingConfig {
                heartbeat_interval: Duration::from_millis(20),
                request_timeout: Duration::from_secs(5),
            },
        );
        manager.ensure_started(&record);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.is_cancelled(&record.request_id).await.unwrap());
        manager.shutdown();
    }
}
