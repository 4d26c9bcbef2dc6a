//! HTTP client for the DFM ingress.
//!
//! Mirrors the ingress surface: `version`, `discover`, `process`, `cancel`,
//! and a polled async response stream that terminates once every named stop
//! node has reached a terminal status.
//!
//! # Example
//!
//! ```rust,no_run
//! use dfm::pipeline::{Node, Pipeline};
//! use dfm_client::{DfmClient, ResponsesOptions};
//! use futures::StreamExt;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DfmClient::new("http://localhost:8080")?;
//!
//! let pipeline = Pipeline::new(vec![Node::new("c", "dfm.api.Constant")
//!     .with_params(json!({"value": 42}))
//!     .output()]);
//! let request_id = client.process(&pipeline).await?;
//!
//! let options = ResponsesOptions::default().with_stop_node_ids(["c"]);
//! let mut responses = client.responses(request_id, options);
//! while let Some(response) = responses.next().await {
//!     println!("{:?}", response?);
//! }
//! # Ok(())
//! # }
//! ```

use dfm::pipeline::{NodeId, Pipeline};
use dfm::request::{RequestId, Response, ResponseBody};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Error type for client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("invalid base URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The ingress answered with an error body.
    #[error("{error_kind}: {message}")]
    Api {
        status: u16,
        error_kind: String,
        message: String,
    },

    #[error("cannot decode server reply: {0}")]
    Decode(String),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub site: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub description: String,
    pub apis: Vec<String>,
}

#[derive(Deserialize)]
struct DiscoverBody {
    providers: Vec<ProviderInfo>,
}

#[derive(Deserialize)]
struct ProcessBody {
    request_id: RequestId,
}

#[derive(Deserialize)]
struct ResponsesBody {
    responses: Vec<Response>,
}

#[derive(Deserialize)]
struct CancelBody {
    ok: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error_kind: String,
    message: String,
}

/// The sleep hook invoked between empty polls, with the consecutive
/// empty-poll count.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

fn default_backoff() -> BackoffFn {
    Arc::new(|empty_polls| {
        let exp = 100u64.saturating_mul(1 << empty_polls.min(5));
        Duration::from_millis(exp.min(2_000))
    })
}

/// Options of one [`DfmClient::responses`] iteration.
#[derive(Clone)]
pub struct ResponsesOptions {
    /// The stream ends once every one of these nodes is terminal. Empty
    /// means iterate until dropped.
    pub stop_node_ids: Vec<NodeId>,
    /// Yield `status` envelopes (default true).
    pub return_statuses: bool,
    /// Yield `heartbeat` envelopes (default false).
    pub return_heartbeats: bool,
    /// Per-poll batch cap.
    pub max: usize,
    /// Per-poll server hold time.
    pub timeout_ms: u64,
    /// Sleep between empty polls.
    pub backoff: BackoffFn,
}

impl Default for ResponsesOptions {
    fn default() -> Self {
        Self {
            stop_node_ids: Vec::new(),
            return_statuses: true,
            return_heartbeats: false,
            max: 64,
            timeout_ms: 2_000,
            backoff: default_backoff(),
        }
    }
}

impl std::fmt::Debug for ResponsesOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsesOptions")
            .field("stop_node_ids", &self.stop_node_ids)
            .field("return_statuses", &self.return_statuses)
            .field("return_heartbeats", &self.return_heartbeats)
            .field("max", &self.max)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl ResponsesOptions {
    #[must_use]
    pub fn with_stop_node_ids<I: Into<NodeId>>(
        mut self,
        ids: impl IntoIterator<Item = I>,
    ) -> Self {
        self.stop_node_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_statuses(mut self, yield_them: bool) -> Self {
        self.return_statuses = yield_them;
        self
    }

    #[must_use]
    pub fn with_heartbeats(mut self, yield_them: bool) -> Self {
        self.return_heartbeats = yield_them;
        self
    }

    #[must_use]
    pub fn with_poll(mut self, max: usize, timeout_ms: u64) -> Self {
        self.max = max;
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Client handle over one DFM site.
#[derive(Clone)]
pub struct DfmClient {
    base_url: Url,
    http: reqwest::Client,
    bearer_token: Option<String>,
}

impl std::fmt::Debug for DfmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DfmClient")
            .field("base_url", &self.base_url.as_str())
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl DfmClient {
    /// Create a client for the ingress at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let with_slash = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&with_slash)
            .map_err(|e| ClientError::InvalidUrl(with_slash.clone(), e.to_string()))?;
        Ok(Self {
            base_url,
            http: reqwest::Client::new(),
            bearer_token: None,
        })
    }

    /// Use a pre-configured `reqwest` client (timeouts, proxies).
    pub fn with_http_client(base_url: &str, http: reqwest::Client) -> Result<Self> {
        let mut client = Self::new(base_url)?;
        client.http = http;
        Ok(client)
    }

    /// Authenticate every call with a bearer token.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(path.to_string(), e.to_string()))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()));
        }
        let body: ErrorBody = response.json().await.map_err(|e| ClientError::Decode(
            format!("error reply without error body (HTTP {status}): {e}"),
        ))?;
        Err(ClientError::Api {
            status: status.as_u16(),
            error_kind: body.error_kind,
            message: body.message,
        })
    }

    /// `GET /version`
    pub async fn version(&self) -> Result<VersionInfo> {
        let response = self
            .authorize(self.http.get(self.endpoint("version")?))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// `GET /discover`
    pub async fn discover(&self) -> Result<Vec<ProviderInfo>> {
        let response = self
            .authorize(self.http.get(self.endpoint("discover")?))
            .send()
            .await?;
        let body: DiscoverBody = Self::decode(response).await?;
        Ok(body.providers)
    }

    /// `POST /process`
    pub async fn process(&self, pipeline: &Pipeline) -> Result<RequestId> {
        let response = self
            .authorize(self.http.post(self.endpoint("process")?).json(pipeline))
            .send()
            .await?;
        let body: ProcessBody = Self::decode(response).await?;
        Ok(body.request_id)
    }

    /// `POST /cancel/{request_id}`
    pub async fn cancel(&self, request_id: &RequestId) -> Result<bool> {
        let response = self
            .authorize(self.http.post(self.endpoint(&format!("cancel/{request_id}"))?))
            .send()
            .await?;
        let body: CancelBody = Self::decode(response).await?;
        Ok(body.ok)
    }

    async fn poll_once(&self, request_id: &RequestId, max: usize, timeout_ms: u64)
        -> Result<Vec<Response>> {
        let mut url = self.endpoint(&format!("responses/{request_id}"))?;
        url.query_pairs_mut()
            .append_pair("max", &max.to_string())
            .append_pair("timeout_ms", &timeout_ms.to_string());
        let response = self.authorize(self.http.get(url)).send().await?;
        let body: ResponsesBody = Self::decode(response).await?;
        Ok(body.responses)
    }

    /// The response iterator: polls `GET /responses/{id}`, yields envelopes
    /// in arrival order, and ends once every stop node is terminal (FAILED
    /// and CANCELLED included) or the stream is dropped.
    pub fn responses(
        &self,
        request_id: RequestId,
        options: ResponsesOptions,
    ) -> impl Stream<Item = Result<Response>> + Unpin {
        let client = self.clone();
        Box::pin(async_stream::stream! {
            let mut open_stops: HashSet<NodeId> =
                options.stop_node_ids.iter().cloned().collect();
            let stop_when_drained = !options.stop_node_ids.is_empty();
            let mut empty_polls: u32 = 0;

            loop {
                let batch = match client
                    .poll_once(&request_id, options.max, options.timeout_ms)
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                if batch.is_empty() {
                    empty_polls += 1;
                    let delay = (options.backoff)(empty_polls);
                    debug!(
                        "empty poll #{empty_polls} for {request_id}; sleeping {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                empty_polls = 0;

                for response in batch {
                    // Stop tracking runs over the raw batch, before any
                    // filtering drops the envelope.
                    open_stops.retain(|stop| !response.is_terminal_for(stop));

                    let keep = match &response.body {
                        ResponseBody::Status { .. } => options.return_statuses,
                        ResponseBody::Heartbeat => options.return_heartbeats,
                        ResponseBody::Value { .. } | ResponseBody::Error { .. } => true,
                    };
                    if keep {
                        yield Ok(response);
                    }

                    if stop_when_drained && open_stops.is_empty() {
                        return;
                    }
                }
            }
        })
    }
}
