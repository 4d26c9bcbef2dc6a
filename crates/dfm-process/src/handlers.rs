//! Request handlers for the ingress endpoints.

use crate::error::{ApiError, Result};
use crate::state::AppState;
use crate::submit::submit_pipeline;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use dfm::error::DfmError;
use dfm::pipeline::Pipeline;
use dfm::request::{RequestId, Response};
use dfm_broker::keys;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionBody {
    pub version: String,
    pub site: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderBody {
    pub name: String,
    pub description: String,
    pub apis: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiscoverBody {
    pub providers: Vec<ProviderBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessBody {
    pub request_id: RequestId,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponsesQuery {
    /// Batch cap; defaults to 64.
    pub max: Option<usize>,
    /// How long the server may hold the poll open waiting for a first
    /// response. Bounded by the server-side cap.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponsesBody {
    pub responses: Vec<Response>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelBody {
    pub ok: bool,
}

/// `GET /version`
pub async fn version_handler(State(state): State<AppState>) -> Json<VersionBody> {
    Json(VersionBody {
        version: dfm::VERSION.to_string(),
        site: state.site.site.clone(),
    })
}

/// `GET /discover`
pub async fn discover_handler(State(state): State<AppState>) -> Json<DiscoverBody> {
    let providers = state
        .site
        .providers
        .iter()
        .map(|(name, provider)| ProviderBody {
            name: name.clone(),
            description: provider.description.clone(),
            apis: provider.interface.keys().cloned().collect(),
        })
        .collect();
    Json(DiscoverBody { providers })
}

/// `POST /process`
#[instrument(skip(state, pipeline), fields(nodes = pipeline.len()))]
pub async fn process_handler(
    State(state): State<AppState>,
    Json(pipeline): Json<Pipeline>,
) -> Result<(StatusCode, Json<ProcessBody>)> {
    let request_id =
        submit_pipeline(&state.store, &state.registry, &state.site, pipeline).await?;
    info!("accepted request {request_id}");
    Ok((StatusCode::ACCEPTED, Json(ProcessBody { request_id })))
}

/// `GET /responses/{request_id}`
///
/// One bounded blocking pop for the first response, then a non-blocking
/// drain up to `max`. An empty batch is a normal outcome; the client polls
/// again.
pub async fn responses_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Query(query): Query<ResponsesQuery>,
) -> Result<Json<ResponsesBody>> {
    let id = RequestId(request_id);
    if !state.store.exists(&id).await? {
        return Err(ApiError(DfmError::NoSuchRequest(id.to_string())));
    }

    let wait = Duration::from_millis(query.timeout_ms.unwrap_or(2_000))
        .min(state.response_poll_cap);
    let max = query.max.unwrap_or(64).clamp(1, 1_024);
    let key = keys::response(&id);

    let mut responses = Vec::new();
    if let Some(raw) = state.store.broker().blocking_pop_front(&key, wait).await? {
        responses.push(decode_response(&raw)?);
    }
    while responses.len() < max {
        match state.store.broker().pop_front(&key).await? {
            Some(raw) => responses.push(decode_response(&raw)?),
            None => break,
        }
    }

    Ok(Json(ResponsesBody { responses }))
}

/// `POST /cancel/{request_id}`
///
/// Idempotent: cancelling twice (or cancelling a finished request) still
/// reports ok.
pub async fn cancel_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<CancelBody>> {
    let id = RequestId(request_id);
    let Some(record) = state.store.load(&id).await? else {
        return Err(ApiError(DfmError::NoSuchRequest(id.to_string())));
    };
    state.store.cancel(&record).await?;
    info!("request {id} cancelled");
    Ok(Json(CancelBody { ok: true }))
}

fn decode_response(raw: &str) -> Result<Response> {
    serde_json::from_str(raw)
        .map_err(|e| ApiError(DfmError::Internal(format!("malformed response entry: {e}"))))
}
