//! DFM core: the shared model of the distributed pipeline runtime.
//!
//! Clients describe a computation as a DAG of typed function calls; a cluster
//! of cooperating services (ingress, scheduler, executor) runs it through
//! pluggable adapters and streams typed responses back. This crate holds
//! everything those services agree on:
//!
//! - the pipeline IR and its wire format ([`pipeline`]),
//! - the closed api-class registry and parameter schemas ([`registry`]),
//! - verification and the deterministic rewrites ([`verify`], [`optimize`]),
//! - content-addressed node fingerprints ([`fingerprint`]),
//! - the request/response model ([`request`]),
//! - site and environment configuration ([`config`]),
//! - the error taxonomy ([`error`]) and telemetry bootstrap ([`telemetry`]).
//!
//! The services themselves live in their own crates (`dfm-process`,
//! `dfm-scheduler`, `dfm-executor`), coupled only through the broker
//! (`dfm-broker`) and the value cache (`dfm-cache`).

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod optimize;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod telemetry;
pub mod verify;

pub use config::{EnvConfig, LogFormat, SiteConfig};
pub use error::{DfmError, ErrorKind, Result};
pub use fingerprint::{node_fingerprint, Fingerprint};
pub use optimize::{optimize_pipeline, OptimizeOutcome};
pub use pipeline::{InputSource, Node, NodeId, Pipeline};
pub use registry::{ApiDescriptor, ApiRegistry, Arity};
pub use request::{NodeState, RequestId, RequestRecord, Response, ResponseBody};
pub use verify::verify_pipeline;

/// Version string reported by the `version` operation.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
