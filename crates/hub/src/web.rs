use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::Db;
use crate::sequencer::EngineHandle;
use crate::state::SharedState;
use crate::timer::{FlushTimer, TimerState};

#[derive(Clone)]
pub struct WebState {
    pub shared: SharedState,
    pub engine: EngineHandle,
    pub timer: FlushTimer,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/sensors", get(api_sensors))
        .route("/api/reload", post(api_reload))
        .route("/api/sync", post(api_sync))
        .route("/api/flush/pause", post(api_flush_pause))
        .route("/api/flush/resume", post(api_flush_resume))
        .with_state(state)
}

async fn api_status(State(state): State<WebState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_sensors(State(state): State<WebState>) -> Response {
    match state.engine.snapshot().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "engine stopped").into_response(),
    }
}

async fn api_reload(State(state): State<WebState>) -> StatusCode {
    state.engine.reload();
    StatusCode::ACCEPTED
}

/// Called by the remote-sync collaborator after a full download. Records
/// the baseline sync, which opens the provisioning gate, then reloads.
async fn api_sync(State(state): State<WebState>) -> Response {
    if let Err(e) = state.db.record_baseline_sync(Utc::now()).await {
        error!("record baseline sync failed: {e:#}");
        state
            .shared
            .write()
            .await
            .record_error(format!("baseline sync: {e:#}"));
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to record sync").into_response();
    }
    state.engine.reload();
    state
        .shared
        .write()
        .await
        .record_system("baseline sync recorded".to_string());
    StatusCode::ACCEPTED.into_response()
}

async fn api_flush_pause(State(state): State<WebState>) -> StatusCode {
    state.timer.pause();
    let mut st = state.shared.write().await;
    st.flush_paused = state.timer.state() == TimerState::Paused;
    st.record_system("flush timer paused".to_string());
    StatusCode::NO_CONTENT
}

async fn api_flush_resume(State(state): State<WebState>) -> StatusCode {
    state.timer.resume();
    let mut st = state.shared.write().await;
    st.flush_paused = state.timer.state() == TimerState::Paused;
    st.record_system("flush timer resumed".to_string());
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: WebState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
