//! Command surface: overlay toggle, control values, stream recovery.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use tandem_core::StreamId;
use tandem_services::SendError;

use super::ApiState;

#[derive(Serialize)]
pub struct OverlayResponse {
    pub local: bool,
    pub overlay_active: bool,
}

fn overlay_response(state: &ApiState) -> Json<OverlayResponse> {
    let toggle = state.session.toggle_state();
    Json(OverlayResponse {
        local: toggle.local,
        overlay_active: toggle.overlay_active(),
    })
}

// ── /overlay ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct OverlayRequest {
    pub active: bool,
}

pub async fn handle_overlay_set(
    State(state): State<ApiState>,
    Json(req): Json<OverlayRequest>,
) -> Json<OverlayResponse> {
    state.session.set_overlay(req.active);
    overlay_response(&state)
}

pub async fn handle_overlay_toggle(State(state): State<ApiState>) -> Json<OverlayResponse> {
    state.session.toggle_overlay();
    overlay_response(&state)
}

// ── /control ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ControlRequest {
    pub values: Vec<f32>,
}

#[derive(Serialize)]
pub struct ControlResponse {
    pub sent: usize,
}

pub async fn handle_control(
    State(state): State<ApiState>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ControlResponse>, (StatusCode, String)> {
    let sent = req.values.len();
    state
        .session
        .send_control(req.values)
        .await
        .map_err(|e| match e {
            SendError::Wire(_) => (StatusCode::BAD_REQUEST, e.to_string()),
            SendError::StreamUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            SendError::Io { .. } => (StatusCode::BAD_GATEWAY, e.to_string()),
        })?;
    Ok(Json(ControlResponse { sent }))
}

// ── /streams/{stream}/reopen ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ReopenResponse {
    pub stream: StreamId,
    pub reopened: bool,
}

pub async fn handle_stream_reopen(
    State(state): State<ApiState>,
    Path(stream): Path<StreamId>,
) -> Result<Json<ReopenResponse>, (StatusCode, String)> {
    state.session.reopen(stream).await.map_err(|e| {
        tracing::warn!(%stream, error = %e, "reopen via API failed");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    })?;
    tracing::info!(%stream, "stream reopened via API");
    Ok(Json(ReopenResponse {
        stream,
        reopened: true,
    }))
}
