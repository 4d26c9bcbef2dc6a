//! DFM delayed-scheduling service.
//!
//! Single responsibility: when a delayed node's time arrives, move it from
//! `sched:delayed` onto `exec:queue` and announce READY. The scheduler never
//! inspects node params or api classes; entries are opaque
//! `(request, node)` pairs scored by due wall-clock milliseconds.
//!
//! A node only lands on the delayed queue once every other eligibility
//! constraint holds: the store's readiness gate parks a node behind its
//! `not_before` only after its `after` set and inputs are satisfied, and an
//! adapter's own `schedule_after` re-parks a node that was already running.
//! Those constraints are monotone, so promotion here is a blind
//! PENDING -> READY transition.
//!
//! Duplicate moves (several scheduler replicas, re-added entries) are made
//! idempotent by a claim sentinel keyed on `(request, node, due_ms)`.

use dfm::request::{NodeState, Response};
use dfm_broker::{keys, BrokerError, QueueEntry, RequestStore};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on the idle sleep between due checks; pub/sub wake-ups
    /// cut it short.
    pub max_poll: Duration,
    /// Claim sentinel TTL. Bounds how long a crashed claimer blocks a
    /// duplicate move.
    pub claim_ttl: Duration,
    /// Base delay of the backoff applied when the broker is unreachable.
    pub retry_base_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_poll: Duration::from_secs(1),
            claim_ttl: Duration::from_secs(60),
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

/// The scheduling service. Holds no local state: a restart resumes exactly
/// where the broker says.
pub struct Scheduler {
    store: RequestStore,
    config: SchedulerConfig,
}

/// Handle over a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl Scheduler {
    pub fn new(store: RequestStore, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started");
        let mut wake = None;
        let mut backoff = self.backoff();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // (Re)subscribe to the wake channel lazily so a broker outage
            // during startup does not kill the loop.
            if wake.is_none() {
                match self.store.broker().subscribe(keys::SCHED_WAKE).await {
                    Ok(stream) => wake = Some(stream),
                    Err(e) => warn!("cannot subscribe to {}: {e}", keys::SCHED_WAKE),
                }
            }

            match self.drain_due().await {
                Ok(()) => backoff = self.backoff(),
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                    warn!("broker unavailable ({e}); retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let sleep_for = match self.next_due_in().await {
                Ok(Some(until_due)) => until_due.min(self.config.max_poll),
                Ok(None) => self.config.max_poll,
                Err(_) => self.config.max_poll,
            };

            let mut subscription_lost = false;
            match &mut wake {
                Some(stream) => {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        message = stream.next() => {
                            if message.is_none() {
                                // Subscription dropped; rebuild next turn.
                                subscription_lost = true;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
            if subscription_lost {
                wake = None;
            }
        }
        info!("scheduler stopped");
    }

    /// Move every due entry. Each move is claimed first, then the node is
    /// marked READY and pushed onto the execution queue.
    async fn drain_due(&self) -> Result<(), BrokerError> {
        loop {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let Some((raw, due_ms)) = self
                .store
                .broker()
                .zset_pop_due(keys::SCHED_DELAYED, now_ms)
                .await?
            else {
                return Ok(());
            };

            let entry = match QueueEntry::decode(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("dropping malformed delayed entry: {e}");
                    continue;
                }
            };

            let claim = keys::sched_claim(&entry.request_id, &entry.node_id, due_ms);
            if !self
                .store
                .broker()
                .set_nx_ex(&claim, "1", self.config.claim_ttl)
                .await?
            {
                debug!(
                    "skipping already-claimed move of {}/{}",
                    entry.request_id, entry.node_id
                );
                continue;
            }

            // Guarded transition: a node cancelled (or otherwise moved on)
            // while it was parked stays where it is.
            if !self
                .store
                .transition_if(
                    &entry.request_id,
                    &entry.node_id,
                    NodeState::Pending,
                    NodeState::Ready,
                )
                .await?
            {
                // A worker that called schedule_after may not have parked the
                // node yet; give a still-RUNNING node another pass shortly.
                let state = self
                    .store
                    .node_state(&entry.request_id, &entry.node_id)
                    .await?;
                if state == Some(NodeState::Running) {
                    let retry_ms = chrono::Utc::now().timestamp_millis() + 100;
                    self.store
                        .broker()
                        .zset_add(keys::SCHED_DELAYED, &raw, retry_ms)
                        .await?;
                } else {
                    debug!(
                        "delayed node {}/{} is no longer PENDING; not moving it",
                        entry.request_id, entry.node_id
                    );
                }
                continue;
            }
            self.store
                .push_response(&Response::status(
                    entry.request_id.clone(),
                    entry.node_id.clone(),
                    NodeState::Ready,
                ))
                .await?;
            self.store.enqueue_exec(&entry).await?;
            debug!(
                "moved {}/{} to the execution queue",
                entry.request_id, entry.node_id
            );
        }
    }

    /// Time until the earliest delayed entry is due.
    async fn next_due_in(&self) -> Result<Option<Duration>, BrokerError> {
        let earliest = self
            .store
            .broker()
            .zset_peek_score(keys::SCHED_DELAYED)
            .await?;
        Ok(earliest.map(|due_ms| {
            let now_ms = chrono::Utc::now().timestamp_millis();
            Duration::from_millis(due_ms.saturating_sub(now_ms).max(0) as u64)
        }))
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.config.retry_base_delay.as_millis().max(2) as u64)
            .max_delay(Duration::from_secs(30))
            .map(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfm::pipeline::{Node, Pipeline};
    use dfm::registry::api;
    use dfm::request::{RequestId, RequestRecord};
    use dfm_broker::{store::request_store, MemoryBroker};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn fixture() -> (RequestStore, RequestRecord) {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let record = RequestRecord {
            request_id: RequestId::generate(),
            pipeline: Pipeline::new(vec![Node::new("d", api::DELAY)
                .with_params(json!({"seconds": 1, "value": "hello"}))]),
            aliases: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        };
        (store, record)
    }

    async fn exec_queue_len(store: &RequestStore) -> usize {
        store.broker().list_len(keys::EXEC_QUEUE).await.unwrap()
    }

    #[tokio::test]
    async fn test_due_entry_moves_to_exec_queue() {
        let (store, record) = fixture();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let entry = QueueEntry::new(record.request_id.clone(), "d".into());
        let past = chrono::Utc::now().timestamp_millis() - 100;
        store.enqueue_delayed(&entry, past).await.unwrap();

        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        scheduler.drain_due().await.unwrap();

        assert_eq!(exec_queue_len(&store).await, 1);
        assert_eq!(
            store
                .node_state(&record.request_id, &"d".into())
                .await
                .unwrap(),
            Some(NodeState::Ready)
        );
        // READY status announced.
        let responses = store
            .broker()
            .list_range(&keys::response(&record.request_id), 0, -1)
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].contains("READY"));
    }

    #[tokio::test]
    async fn test_future_entry_stays_parked() {
        let (store, record) = fixture();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let entry = QueueEntry::new(record.request_id.clone(), "d".into());
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        store.enqueue_delayed(&entry, future).await.unwrap();

        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        scheduler.drain_due().await.unwrap();

        assert_eq!(exec_queue_len(&store).await, 0);
        let until = scheduler.next_due_in().await.unwrap().unwrap();
        assert!(until > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_claim_makes_duplicate_moves_idempotent() {
        let (store, record) = fixture();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let entry = QueueEntry::new(record.request_id.clone(), "d".into());
        let due = chrono::Utc::now().timestamp_millis() - 100;

        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());

        // The same entry lands twice with the same due time (re-added by a
        // retry); only one move happens.
        store.enqueue_delayed(&entry, due).await.unwrap();
        scheduler.drain_due().await.unwrap();
        store.enqueue_delayed(&entry, due).await.unwrap();
        scheduler.drain_due().await.unwrap();

        assert_eq!(exec_queue_len(&store).await, 1);
    }

    #[tokio::test]
    async fn test_distinct_due_times_both_move() {
        let (store, record) = fixture();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let entry = QueueEntry::new(record.request_id.clone(), "d".into());
        let now = chrono::Utc::now().timestamp_millis();

        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        store.enqueue_delayed(&entry, now - 200).await.unwrap();
        scheduler.drain_due().await.unwrap();

        // A genuine re-schedule: the worker parked the node back to PENDING
        // before handing it to the delayed queue with a new due time.
        store
            .set_node_state(&record.request_id, &"d".into(), NodeState::Pending)
            .await
            .unwrap();
        store.enqueue_delayed(&entry, now - 100).await.unwrap();
        scheduler.drain_due().await.unwrap();

        assert_eq!(exec_queue_len(&store).await, 2);
    }

    #[tokio::test]
    async fn test_wake_publication_rouses_loop() {
        let (store, record) = fixture();
        store.create(&record, &BTreeMap::new()).await.unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            SchedulerConfig {
                // Long idle sleep: only the wake channel can move things fast.
                max_poll: Duration::from_secs(30),
                ..SchedulerConfig::default()
            },
        );
        let handle = scheduler.spawn();

        // Let the loop park itself, then schedule something due now;
        // enqueue_delayed publishes the wake.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let entry = QueueEntry::new(record.request_id.clone(), "d".into());
        store
            .enqueue_delayed(&entry, chrono::Utc::now().timestamp_millis())
            .await
            .unwrap();

        let mut moved = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if exec_queue_len(&store).await == 1 {
                moved = true;
                break;
            }
        }
        handle.shutdown().await;
        assert!(moved, "wake publication did not rouse the scheduler");
    }
}
