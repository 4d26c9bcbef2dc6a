//! The streaming-value plane between nodes.
//!
//! Every value a node yields is fanned out to its consumers' input buffers
//! (`input:<request>:<consumer>:<port>` lists); a close marker follows the
//! last value. Input streams read those buffers by cursor, without
//! consuming, so a retried activation replays its input from the start.

use crate::adapter::ValueStream;
use dfm::error::{DfmError, Result};
use dfm::pipeline::{InputSource, Node, NodeId, Pipeline};
use dfm::request::RequestId;
use dfm_broker::{keys, BrokerHandle, RequestStore};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Poll cadence of an input stream waiting for its upstream.
const INPUT_POLL: Duration = Duration::from_millis(50);

/// One element of an input-port buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortItem {
    /// A value in upstream yield order.
    Value(Value),
    /// The upstream completed; no further values will arrive.
    Closed,
}

impl PortItem {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A live stream over one input-port buffer. Ends at the close marker; an
/// upstream that never closes is bounded by the node's cancellation checks
/// and soft timeout.
pub fn port_stream(broker: BrokerHandle, key: String) -> ValueStream {
    Box::pin(async_stream::stream! {
        let mut cursor: isize = 0;
        loop {
            let items = match broker.list_range(&key, cursor, cursor).await {
                Ok(items) => items,
                Err(e) => {
                    yield Err(DfmError::from(e));
                    break;
                }
            };
            let Some(raw) = items.into_iter().next() else {
                tokio::time::sleep(INPUT_POLL).await;
                continue;
            };
            cursor += 1;
            match serde_json::from_str::<PortItem>(&raw) {
                Ok(PortItem::Value(value)) => yield Ok(value),
                Ok(PortItem::Closed) => break,
                Err(e) => {
                    yield Err(DfmError::Internal(format!(
                        "malformed input buffer entry on '{key}': {e}"
                    )));
                    break;
                }
            }
        }
    })
}

/// A single-value, immediately-closed stream for a folded literal input.
pub fn literal_stream(value: Value) -> ValueStream {
    futures::stream::once(async move { Ok(value) }).boxed()
}

/// A replay of a sealed cache entry, in yield order.
pub fn replay_stream(values: Vec<Value>) -> ValueStream {
    futures::stream::iter(values.into_iter().map(Ok)).boxed()
}

/// Build the upstream streams for a node, in port order.
pub fn node_input_streams(broker: &BrokerHandle, id: &RequestId, node: &Node) -> Vec<ValueStream> {
    node.inputs
        .iter()
        .enumerate()
        .map(|(port, input)| match input {
            InputSource::Literal { literal } => literal_stream(literal.clone()),
            InputSource::Node(_) => port_stream(
                broker.clone(),
                keys::input(id, &node.node_id, port),
            ),
        })
        .collect()
}

/// Push one produced value into every consumer's input buffer.
pub async fn deliver_to_consumers(
    store: &RequestStore,
    pipeline: &Pipeline,
    id: &RequestId,
    producer: &NodeId,
    value: &Value,
) -> Result<()> {
    let item = PortItem::Value(value.clone()).encode()?;
    for (consumer, port) in pipeline.consumers(producer) {
        store
            .broker()
            .push_back(&keys::input(id, &consumer, port), &item)
            .await?;
    }
    Ok(())
}

/// Close every consumer port fed by `producer`: append the close marker and
/// set the port-closed flag used by readiness checks.
pub async fn close_consumer_ports(
    store: &RequestStore,
    pipeline: &Pipeline,
    id: &RequestId,
    producer: &NodeId,
) -> Result<()> {
    let marker = PortItem::Closed.encode()?;
    for (consumer, port) in pipeline.consumers(producer) {
        store
            .broker()
            .push_back(&keys::input(id, &consumer, port), &marker)
            .await?;
        store.mark_port_closed(id, &consumer, port).await?;
    }
    Ok(())
}
