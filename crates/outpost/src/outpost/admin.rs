use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::outpost::{net, telemetry::RecentEvents, tunnel::registry::Registry};

const DEFAULT_EVENTS_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AdminState {
    pub prom: Arc<PrometheusHandle>,
    pub config_path: PathBuf,
    pub reload_tx: watch::Sender<u64>,
    /// Present when the relay is enabled.
    pub registry: Option<Arc<Registry>>,
    pub recent: Option<Arc<RecentEvents>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/tunnels", get(tunnels))
        .route("/tunnels/{id}", delete(kill_tunnel))
        .route("/events", get(events))
        .route("/reload", post(reload))
        .route("/config", get(config))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            net::shutdown_requested(&mut shutdown).await;
        })
        .await
        .context("admin: serve")
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn tunnels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = st
        .registry
        .as_ref()
        .map(|r| r.snapshot())
        .unwrap_or_default();
    (StatusCode::OK, Json(snap))
}

#[derive(Debug, Serialize)]
struct KillResponse {
    killed: bool,
}

async fn kill_tunnel(
    State(st): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = net::host_without_port(&id);
    let killed = st.registry.as_ref().is_some_and(|r| r.kill(&id));
    let status = if killed {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(KillResponse { killed }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    tunnel: Option<String>,
    limit: Option<usize>,
}

async fn events(
    State(st): State<Arc<AdminState>>,
    Query(q): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_EVENTS_LIMIT);
    let tunnel = q.tunnel.as_deref().filter(|t| !t.is_empty());
    let snap = st
        .recent
        .as_ref()
        .map(|r| r.snapshot(tunnel, limit))
        .unwrap_or_default();
    (StatusCode::OK, Json(snap))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
}

async fn reload(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut seq = 0;
    st.reload_tx.send_modify(|v| {
        *v += 1;
        seq = *v;
    });
    (StatusCode::OK, Json(ReloadResponse { seq }))
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}
