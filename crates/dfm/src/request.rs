//! The runtime record of one pipeline submission.
//!
//! A request is created when the ingress accepts a pipeline and lives in the
//! broker until TTL expiry. Per-node state transitions and the typed response
//! envelopes that flow back to the client are defined here.

use crate::error::ErrorKind;
use crate::pipeline::{NodeId, Pipeline};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Opaque request identifier returned to the client.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Mint a fresh id.
    pub fn generate() -> Self {
        RequestId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}

/// Lifecycle state of one node within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "PENDING",
            NodeState::Ready => "READY",
            NodeState::Running => "RUNNING",
            NodeState::Completed => "COMPLETED",
            NodeState::Failed => "FAILED",
            NodeState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "PENDING" => Ok(NodeState::Pending),
            "READY" => Ok(NodeState::Ready),
            "RUNNING" => Ok(NodeState::Running),
            "COMPLETED" => Ok(NodeState::Completed),
            "FAILED" => Ok(NodeState::Failed),
            "CANCELLED" => Ok(NodeState::Cancelled),
            other => Err(format!("unknown node state '{other}'")),
        }
    }
}

/// Everything the ingress persists about a submission, minus the mutable
/// per-node fields that live as individual broker hash fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    /// The pipeline after verification and optimization.
    pub pipeline: Pipeline,
    /// Collapsed duplicate node ids, mapped to their surviving node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<NodeId, NodeId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Payload of one message to the client, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    /// A typed datum produced by the node.
    Value { value: Value },
    /// A lifecycle transition.
    Status {
        state: NodeState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Periodic liveness signal, one producer per request.
    Heartbeat,
    /// Terminal failure detail.
    Error {
        error_kind: ErrorKind,
        message: String,
        /// For cascade cancellations, the node whose failure caused this one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin_node_id: Option<NodeId>,
    },
}

/// One message on a request's response queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    /// Absent only for heartbeats, which are per-request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    pub fn value(request_id: RequestId, node_id: NodeId, value: Value) -> Self {
        Self {
            request_id,
            node_id: Some(node_id),
            body: ResponseBody::Value { value },
        }
    }

    pub fn status(request_id: RequestId, node_id: NodeId, state: NodeState) -> Self {
        Self {
            request_id,
            node_id: Some(node_id),
            body: ResponseBody::Status {
                state,
                message: None,
            },
        }
    }

    pub fn status_with_message(
        request_id: RequestId,
        node_id: NodeId,
        state: NodeState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            node_id: Some(node_id),
            body: ResponseBody::Status {
                state,
                message: Some(message.into()),
            },
        }
    }

    pub fn heartbeat(request_id: RequestId) -> Self {
        Self {
            request_id,
            node_id: None,
            body: ResponseBody::Heartbeat,
        }
    }

    pub fn error(
        request_id: RequestId,
        node_id: NodeId,
        error_kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            node_id: Some(node_id),
            body: ResponseBody::Error {
                error_kind,
                message: message.into(),
                origin_node_id: None,
            },
        }
    }

    pub fn cascade_error(
        request_id: RequestId,
        node_id: NodeId,
        origin: NodeId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            node_id: Some(node_id),
            body: ResponseBody::Error {
                error_kind: ErrorKind::Cancelled,
                message: message.into(),
                origin_node_id: Some(origin),
            },
        }
    }

    /// The node state carried by a status body, if any.
    pub fn state(&self) -> Option<NodeState> {
        match &self.body {
            ResponseBody::Status { state, .. } => Some(*state),
            _ => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.body, ResponseBody::Heartbeat)
    }

    /// Whether this response marks `node_id` terminal (terminal status or
    /// error envelope).
    pub fn is_terminal_for(&self, node_id: &NodeId) -> bool {
        if self.node_id.as_ref() != Some(node_id) {
            return false;
        }
        match &self.body {
            ResponseBody::Status { state, .. } => state.is_terminal(),
            ResponseBody::Error { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ==========================================================================
    // Unit Tests - Node States
    // ==========================================================================

    #[test]
    fn test_terminal_states() {
        assert!(NodeState::Completed.is_terminal());
        assert!(NodeState::Failed.is_terminal());
        assert!(NodeState::Cancelled.is_terminal());
        assert!(!NodeState::Pending.is_terminal());
        assert!(!NodeState::Ready.is_terminal());
        assert!(!NodeState::Running.is_terminal());
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            NodeState::Pending,
            NodeState::Ready,
            NodeState::Running,
            NodeState::Completed,
            NodeState::Failed,
            NodeState::Cancelled,
        ] {
            let parsed: NodeState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("DONE".parse::<NodeState>().is_err());
    }

    #[test]
    fn test_state_serde_is_screaming_snake() {
        assert_eq!(
            serde_json::to_value(NodeState::Running).unwrap(),
            json!("RUNNING")
        );
    }

    // ==========================================================================
    // Unit Tests - Response Envelopes
    // ==========================================================================

    #[test]
    fn test_value_response_wire_shape() {
        let r = Response::value("req-1".into(), "c".into(), json!(42));
        let wire = serde_json::to_value(&r).unwrap();
        assert_eq!(
            wire,
            json!({"request_id": "req-1", "node_id": "c", "kind": "value", "value": 42})
        );
    }

    #[test]
    fn test_status_response_wire_shape() {
        let r = Response::status("req-1".into(), "c".into(), NodeState::Ready);
        let wire = serde_json::to_value(&r).unwrap();
        assert_eq!(
            wire,
            json!({"request_id": "req-1", "node_id": "c", "kind": "status", "state": "READY"})
        );
    }

    #[test]
    fn test_heartbeat_omits_node_id() {
        let r = Response::heartbeat("req-1".into());
        let wire = serde_json::to_value(&r).unwrap();
        assert_eq!(wire, json!({"request_id": "req-1", "kind": "heartbeat"}));
    }

    #[test]
    fn test_error_response_wire_shape() {
        let r = Response::error(
            "req-1".into(),
            "a".into(),
            ErrorKind::UpstreamUnavailable,
            "archive unreachable",
        );
        let wire = serde_json::to_value(&r).unwrap();
        assert_eq!(wire["kind"], "error");
        assert_eq!(wire["error_kind"], "UPSTREAM_UNAVAILABLE");
        assert!(wire.get("origin_node_id").is_none());
    }

    #[test]
    fn test_cascade_error_names_origin() {
        let r = Response::cascade_error("req-1".into(), "b".into(), "a".into(), "upstream failed");
        let wire = serde_json::to_value(&r).unwrap();
        assert_eq!(wire["error_kind"], "CANCELLED");
        assert_eq!(wire["origin_node_id"], "a");
    }

    #[test]
    fn test_response_roundtrip() {
        for r in [
            Response::value("r".into(), "n".into(), json!({"k": [1, 2]})),
            Response::status("r".into(), "n".into(), NodeState::Completed),
            Response::heartbeat("r".into()),
            Response::error("r".into(), "n".into(), ErrorKind::Internal, "boom"),
        ] {
            let text = serde_json::to_string(&r).unwrap();
            let back: Response = serde_json::from_str(&text).unwrap();
            assert_eq!(r, back);
        }
    }

    #[test]
    fn test_is_terminal_for() {
        let node: NodeId = "n".into();
        assert!(Response::status("r".into(), node.clone(), NodeState::Failed)
            .is_terminal_for(&node));
        assert!(!Response::status("r".into(), node.clone(), NodeState::Running)
            .is_terminal_for(&node));
        assert!(
            Response::error("r".into(), node.clone(), ErrorKind::Internal, "x")
                .is_terminal_for(&node)
        );
        assert!(!Response::status("r".into(), "other".into(), NodeState::Failed)
            .is_terminal_for(&node));
        assert!(!Response::heartbeat("r".into()).is_terminal_for(&node));
    }
}
