//! DFM execution service.
//!
//! Pulls ready work from the execution queue, resolves each node to an
//! adapter through the site's provider table, runs the adapter as a lazy
//! value stream, persists results in the content-addressed cache, routes
//! values to the client response queue and downstream input buffers, and
//! propagates readiness or failure through the DAG.
//!
//! The extension model lives here too: [`adapter::Adapter`] is the seam
//! adapter authors implement, [`dispatch::AdapterRegistry`] the table that
//! binds `(provider, api_class)` pairs to implementations, and
//! [`adapters`] the built-in `dfm` provider set.

pub mod adapter;
pub mod adapters;
pub mod dispatch;
pub mod heartbeat;
pub mod streams;
pub mod testing;
pub mod worker;

pub use adapter::{Adapter, AdapterContext, ProviderRuntime, ValueStream};
pub use dispatch::{builtin_site, AdapterRegistry};
pub use heartbeat::{HousekeepingConfig, HousekeepingManager};
pub use worker::{Executor, ExecutorConfig, ExecutorHandle};
