//! The normative broker keyspace.
//!
//! Every key the services touch is built here, so the layout can be read in
//! one place:
//!
//! - `exec:queue` — FIFO list of [`QueueEntry`](crate::QueueEntry) JSON.
//! - `sched:delayed` — sorted set of entries keyed by due wall-clock ms.
//! - `sched:wake` — pub/sub channel for scheduler wake-up.
//! - `sched:claim:<request>:<node>:<due_ms>` — scheduler idempotence sentinel.
//! - `request:<id>` — hash: record JSON, per-node state/fingerprint/
//!   continuation fields, port-close markers, cancellation flag.
//! - `response:<id>` — FIFO list of response JSON.
//! - `input:<id>:<node>:<port>` — FIFO list feeding one input port.
//! - `cache:<fp>` — value list of a cache entry.
//! - `cache:meta:<fp>` — hash: sealed flag, byte size, last-read ms.
//! - `cache:lock:<fp>` — builder lock, auto-expiring.
//! - `cache:lru` — sorted set of sealed fingerprints by last-read ms.
//! - `cache:sealed` — pub/sub channel announcing sealed fingerprints.

use dfm::fingerprint::Fingerprint;
use dfm::pipeline::NodeId;
use dfm::request::RequestId;

pub const EXEC_QUEUE: &str = "exec:queue";
pub const SCHED_DELAYED: &str = "sched:delayed";
pub const SCHED_WAKE: &str = "sched:wake";
pub const CACHE_LRU: &str = "cache:lru";
pub const CACHE_SEALED_CHANNEL: &str = "cache:sealed";

/// `request:<id>` — the request record hash.
pub fn request(id: &RequestId) -> String {
    format!("request:{id}")
}

/// `response:<id>` — the client-facing response queue.
pub fn response(id: &RequestId) -> String {
    format!("response:{id}")
}

/// `input:<id>:<node>:<port>` — one input port's value buffer.
pub fn input(id: &RequestId, node: &NodeId, port: usize) -> String {
    format!("input:{id}:{node}:{port}")
}

/// `sched:claim:<request>:<node>:<due_ms>` — claim sentinel making delayed
/// moves idempotent across scheduler replicas.
pub fn sched_claim(id: &RequestId, node: &NodeId, due_ms: i64) -> String {
    format!("sched:claim:{id}:{node}:{due_ms}")
}

/// `exec:claim:<request>:<node>` — a worker's liveness claim on a node run.
/// Expires if the worker's process dies, letting the node be reclaimed.
pub fn exec_claim(id: &RequestId, node: &NodeId) -> String {
    format!("exec:claim:{id}:{node}")
}

/// `cache:<fp>` — the value list of a cache entry.
pub fn cache(fp: &Fingerprint) -> String {
    format!("cache:{fp}")
}

/// `cache:meta:<fp>` — cache entry metadata.
pub fn cache_meta(fp: &Fingerprint) -> String {
    format!("cache:meta:{fp}")
}

/// `cache:lock:<fp>` — the single-producer builder lock.
pub fn cache_lock(fp: &Fingerprint) -> String {
    format!("cache:lock:{fp}")
}

/// Field names within the `request:<id>` hash.
pub mod fields {
    use dfm::pipeline::NodeId;

    /// The immutable `RequestRecord` JSON.
    pub const RECORD: &str = "record";

    /// Set to `"1"` when the request is cancelled.
    pub const CANCELLED: &str = "cancelled";

    /// Per-node lifecycle state, as the state's wire string.
    pub fn state(node: &NodeId) -> String {
        format!("state:{node}")
    }

    /// Per-node fingerprint, filled at submission.
    pub fn fingerprint(node: &NodeId) -> String {
        format!("fingerprint:{node}")
    }

    /// Adapter-owned continuation blob for deferred nodes.
    pub fn continuation(node: &NodeId) -> String {
        format!("continuation:{node}")
    }

    /// Set to `"1"` once the upstream feeding `port` of `node` has closed.
    pub fn port_closed(node: &NodeId, port: usize) -> String {
        format!("closed:{node}:{port}")
    }
}

/// Field names within `cache:meta:<fp>` hashes.
pub mod cache_fields {
    pub const SEALED: &str = "sealed";
    pub const BYTES: &str = "bytes";
    pub const LAST_READ_MS: &str = "last_read_ms";
}
