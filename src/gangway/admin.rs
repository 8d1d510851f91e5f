use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::gangway::tunnel::{
    client::{Client, ProxyStatus, SessionState},
    control::ClientSnapshot,
    dispatch::ProxyInfo,
    manager::ClientManager,
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: PrometheusHandle,
    pub server: Option<Arc<ClientManager>>,
    pub client: Option<Arc<Client>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/clients", get(clients))
        .route("/proxies", get(proxies))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    clients: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        ok: true,
        clients: st.server.as_ref().map(|m| m.len()),
        session: st.client.as_ref().map(|c| c.state()),
        client_id: st
            .client
            .as_ref()
            .map(|c| c.client_id())
            .filter(|id| !id.is_empty()),
    };
    (StatusCode::OK, Json(resp))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn clients(State(st): State<Arc<AdminState>>) -> Json<Vec<ClientSnapshot>> {
    Json(st.server.as_ref().map(|m| m.snapshot()).unwrap_or_default())
}

#[derive(Debug, Serialize)]
struct ProxiesResponse {
    server: Vec<ProxyInfo>,
    client: Vec<ProxyStatus>,
}

async fn proxies(State(st): State<Arc<AdminState>>) -> Json<ProxiesResponse> {
    Json(ProxiesResponse {
        server: st.server.as_ref().map(|m| m.proxies()).unwrap_or_default(),
        client: st
            .client
            .as_ref()
            .map(|c| c.proxy_status())
            .unwrap_or_default(),
    })
}
