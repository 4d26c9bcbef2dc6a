//! DFM ingress service.
//!
//! The HTTP front-end of the runtime: accepts pipelines, assigns request
//! ids, verifies and optimizes, seeds the executor and scheduler queues, and
//! serves response polling and cancellation.

pub mod error;
pub mod handlers;
pub mod server;
pub mod state;
pub mod submit;

pub use error::{ApiError, ErrorBody};
pub use server::{build_router, serve};
pub use state::AppState;
pub use submit::submit_pipeline;
