//! Router assembly and the serve loop.

use crate::handlers::{
    cancel_handler, discover_handler, process_handler, responses_handler, version_handler,
};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{from_fn_with_state, Next},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Liveness probe.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness probe: the broker must answer.
async fn ready_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    match state.store.broker().exists("ready-probe").await {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::warn!("readiness check failed: broker unavailable: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "broker unavailable")
        }
    }
}

/// Bearer-token check applied to the API routes when the site configures a
/// token. Probes stay open for the orchestrator.
async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> axum::response::Response {
    let Some(expected) = &state.auth_token else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(crate::error::ErrorBody {
                error_kind: "UNAUTHORIZED".to_string(),
                message: "missing or invalid bearer token".to_string(),
            }),
        )
            .into_response()
    }
}

/// Build the ingress router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/version", get(version_handler))
        .route("/discover", get(discover_handler))
        .route("/process", post(process_handler))
        .route("/responses/:request_id", get(responses_handler))
        .route("/cancel/:request_id", post(cancel_handler))
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(api)
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until the shutdown future resolves.
pub async fn serve(
    router: Router,
    bind_addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("ingress listening on {bind_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
