//! The submission path: verify, optimize, persist, enqueue.

use dfm::config::SiteConfig;
use dfm::error::Result;
use dfm::optimize::optimize_pipeline;
use dfm::pipeline::Pipeline;
use dfm::registry::ApiRegistry;
use dfm::request::{RequestId, RequestRecord};
use dfm::verify::verify_pipeline;
use dfm_broker::RequestStore;
use tracing::info;

/// Accept one pipeline: verify it against the site, run the deterministic
/// rewrites, persist the request record, and seed the queues with the
/// initial ready set. Every node goes through the store's readiness gate,
/// which also parks otherwise-eligible nodes with a future `not_before` on
/// the delayed queue; a node carrying both a `not_before` and open `after`
/// constraints stays PENDING until dependency completion routes it through
/// the same gate.
pub async fn submit_pipeline(
    store: &RequestStore,
    registry: &ApiRegistry,
    site: &SiteConfig,
    pipeline: Pipeline,
) -> Result<RequestId> {
    verify_pipeline(&pipeline, registry, site)?;
    let outcome = optimize_pipeline(pipeline)?;

    let record = RequestRecord {
        request_id: RequestId::generate(),
        pipeline: outcome.pipeline,
        aliases: outcome.aliases,
        created_at: chrono::Utc::now(),
    };
    store.create(&record, &outcome.fingerprints).await?;

    for node in &record.pipeline.nodes {
        store.try_enqueue_ready(&record, node, registry).await?;
    }

    info!(
        "request {} accepted with {} node(s)",
        record.request_id,
        record.pipeline.len()
    );
    Ok(record.request_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfm::config::{AdapterBinding, ProviderConfig};
    use dfm::pipeline::Node;
    use dfm::registry::api;
    use dfm::request::NodeState;
    use dfm_broker::{keys, store::request_store, MemoryBroker, QueueEntry};
    use serde_json::json;
    use std::sync::Arc;

    fn site() -> SiteConfig {
        let interface = [
            api::CONSTANT,
            api::GREET_ME,
            api::SIGNAL_CLIENT,
            api::EVAL_EXPR,
        ]
        .iter()
        .map(|class| {
            (
                class.to_string(),
                AdapterBinding::new(format!("{class}Adapter")),
            )
        })
        .collect();

        SiteConfig {
            site: "test".to_string(),
            providers: [(
                "dfm".to_string(),
                ProviderConfig {
                    description: String::new(),
                    cache_fsspec_conf: None,
                    interface,
                },
            )]
            .into_iter()
            .collect(),
        }
    }

    #[tokio::test]
    async fn test_submit_seeds_initial_ready_set() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let registry = ApiRegistry::builtin();

        let pipeline = Pipeline::new(vec![
            Node::new("c", api::CONSTANT)
                .with_params(json!({"value": 42}))
                .output(),
            Node::new("sig", api::SIGNAL_CLIENT)
                .with_params(json!({"message": "ok"}))
                .with_after(["c"]),
        ]);
        let id = submit_pipeline(&store, &registry, &site(), pipeline)
            .await
            .unwrap();

        // Only the constant is initially ready; the signal waits on `after`.
        let raw = store
            .broker()
            .pop_front(keys::EXEC_QUEUE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(QueueEntry::decode(&raw).unwrap().node_id, "c".into());
        assert!(store
            .broker()
            .pop_front(keys::EXEC_QUEUE)
            .await
            .unwrap()
            .is_none());

        assert_eq!(
            store.node_state(&id, &"c".into()).await.unwrap(),
            Some(NodeState::Ready)
        );
        assert_eq!(
            store.node_state(&id, &"sig".into()).await.unwrap(),
            Some(NodeState::Pending)
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_pipeline_without_side_effects() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let registry = ApiRegistry::builtin();

        let pipeline = Pipeline::new(vec![Node::new("x", "dfm.api.Nope")]);
        let err = submit_pipeline(&store, &registry, &site(), pipeline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), dfm::ErrorKind::BadPipeline);
        assert_eq!(store.broker().list_len(keys::EXEC_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submit_folds_constants_before_enqueue() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let registry = ApiRegistry::builtin();

        let pipeline = Pipeline::new(vec![
            Node::new("c", api::CONSTANT).with_params(json!({"value": 3})),
            Node::new("sq", api::EVAL_EXPR)
                .with_params(json!({"expression": "x * x"}))
                .with_inputs(["c"])
                .output(),
        ]);
        let id = submit_pipeline(&store, &registry, &site(), pipeline)
            .await
            .unwrap();

        let record = store.load(&id).await.unwrap().unwrap();
        // The constant folded away; the consumer is immediately ready.
        assert_eq!(record.pipeline.len(), 1);
        assert_eq!(
            store.node_state(&id, &"sq".into()).await.unwrap(),
            Some(NodeState::Ready)
        );
    }

    #[tokio::test]
    async fn test_submit_parks_not_before_nodes() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let registry = ApiRegistry::builtin();

        let node = Node::new("late", api::GREET_ME)
            .with_params(json!({"name": "ada"}))
            .with_not_before(chrono::Utc::now() + chrono::Duration::seconds(60));
        let id = submit_pipeline(&store, &registry, &site(), Pipeline::new(vec![node]))
            .await
            .unwrap();

        assert_eq!(store.broker().list_len(keys::EXEC_QUEUE).await.unwrap(), 0);
        assert!(store
            .broker()
            .zset_peek_score(keys::SCHED_DELAYED)
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            store.node_state(&id, &"late".into()).await.unwrap(),
            Some(NodeState::Pending)
        );
    }

    #[tokio::test]
    async fn test_submit_holds_not_before_behind_after() {
        // A due time never outranks an ordering constraint: the node is not
        // parked on the delayed queue while its `after` set is open.
        let store = request_store(Arc::new(MemoryBroker::new()));
        let registry = ApiRegistry::builtin();

        let pipeline = Pipeline::new(vec![
            Node::new("a", api::GREET_ME).with_params(json!({"name": "ada"})),
            Node::new("b", api::SIGNAL_CLIENT)
                .with_params(json!({"message": "go"}))
                .with_after(["a"])
                .with_not_before(chrono::Utc::now() + chrono::Duration::seconds(1)),
        ]);
        let id = submit_pipeline(&store, &registry, &site(), pipeline)
            .await
            .unwrap();

        // Only `a` is queued anywhere; `b` waits for `a` to complete before
        // it can even be parked.
        assert_eq!(store.broker().list_len(keys::EXEC_QUEUE).await.unwrap(), 1);
        assert!(store
            .broker()
            .zset_peek_score(keys::SCHED_DELAYED)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.node_state(&id, &"b".into()).await.unwrap(),
            Some(NodeState::Pending)
        );
    }

    #[tokio::test]
    async fn test_submit_empty_pipeline() {
        let store = request_store(Arc::new(MemoryBroker::new()));
        let registry = ApiRegistry::builtin();
        let id = submit_pipeline(&store, &registry, &site(), Pipeline::default())
            .await
            .unwrap();
        assert!(store.exists(&id).await.unwrap());
    }
}
