//! Admin status API (N, §4.15): read-only `/health`, `/sessions`, `/pool` endpoints. No mutation
//! endpoints — there's nothing to reload, this crate has no hot-reloadable config.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::eldatun::client::pool::Pool;
use crate::eldatun::telemetry::SharedSessions;

#[derive(Clone)]
pub struct AdminState {
    pub sessions: SharedSessions,
    pub pool: Option<Arc<Pool>>,
}

pub async fn serve(addr: SocketAddr, state: AdminState) -> anyhow::Result<()> {
    let shared = Arc::new(state);

    let app = Router::new()
        .route("/health", get(health))
        .route("/sessions", get(sessions))
        .route("/pool", get(pool))
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

#[derive(Debug, Serialize)]
struct PoolResponse {
    active_sessions: Option<usize>,
}

async fn pool(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let active_sessions = match &st.pool {
        Some(p) => Some(p.len().await),
        None => None,
    };
    (StatusCode::OK, Json(PoolResponse { active_sessions }))
}
