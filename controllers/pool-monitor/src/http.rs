//! Probe, metrics and debug HTTP endpoints.
//!
//! - `GET /healthz`: liveness probe
//! - `GET /metrics`: Prometheus text exposition of the daemon's registry
//! - `GET /debug/ipam`: pool monitor state snapshot and IP pool counts

use crate::error::ControllerError;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use ipam_pool::{IpConfigStore, IpPoolCounts, IpPoolSnapshotSource, MonitorHandle, PoolMonitorStateSnapshot};
use prometheus::{Registry, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub registry: Registry,
    pub monitor: MonitorHandle,
    pub store: Arc<IpConfigStore>,
}

#[derive(Debug, Serialize)]
struct DebugIpam {
    monitor: Option<PoolMonitorStateSnapshot>,
    pool: IpPoolCounts,
}

/// Builds the router
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/debug/ipam", get(debug_ipam))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics(State(state): State<HttpState>) -> Response {
    match TextEncoder::new().encode_to_string(&state.registry.gather()) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn debug_ipam(State(state): State<HttpState>) -> Json<DebugIpam> {
    Json(DebugIpam {
        monitor: state.monitor.state_snapshot(),
        pool: state.store.pool_counts(),
    })
}

/// Serves the endpoints on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: HttpState,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving probes and metrics on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
