//! HTTP error mapping for the ingress surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dfm::error::{DfmError, ErrorKind};
use serde::{Deserialize, Serialize};

/// Error body of every non-2xx ingress reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_kind: String,
    pub message: String,
}

/// Error wrapper giving [`DfmError`] an HTTP rendering.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub DfmError);

impl From<dfm_broker::BrokerError> for ApiError {
    fn from(err: dfm_broker::BrokerError) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::BadPipeline | ErrorKind::AdapterBadInput => StatusCode::BAD_REQUEST,
            ErrorKind::NoSuchRequest => StatusCode::NOT_FOUND,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error_kind: self.0.kind().as_str().to_string(),
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

/// Result type alias for ingress handlers.
pub type Result<T> = std::result::Result<T, ApiError>;
