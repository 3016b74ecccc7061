//! HTTP endpoint for metrics scraping and the liveness probe.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

use super::HealthState;

/// Shared state for the observability router.
#[derive(Clone)]
pub struct ObserveState {
    pub registry: Registry,
    pub health: Arc<HealthState>,
}

pub fn create_router(state: ObserveState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ObserveState,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

async fn metrics(State(state): State<ObserveState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut buf) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response()
        }
    }
}

async fn healthz(State(state): State<ObserveState>) -> impl IntoResponse {
    let live = state.health.is_live();
    let status = if live {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(serde_json::json!({
        "status": if live { "ok" } else { "unhealthy" },
        "seconds_since_last_batch": state.health.seconds_since_last_batch(),
    }));
    (status, body)
}
