//! /status and /daemon/shutdown handlers.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use tandem_core::{StreamId, TransportMode};
use tandem_services::{RenderMode, StatsSnapshot, StreamStatus};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub transport: TransportMode,
    pub toggle: ToggleInfo,
    pub render_mode: Option<RenderMode>,
    pub streams: BTreeMap<StreamId, StreamInfo>,
}

#[derive(Serialize)]
pub struct ToggleInfo {
    pub local: bool,
    pub remote: bool,
    pub overlay_active: bool,
    /// Milliseconds since the peer's toggle was last heard, if ever.
    pub remote_age_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct StreamInfo {
    pub status: StreamStatus,
    pub local_addr: Option<String>,
    pub stats: StatsSnapshot,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let session = &state.session;
    let toggle = session.toggle_state();
    let stats = session.stats();

    let streams = session
        .stream_status()
        .into_iter()
        .map(|(id, status)| {
            let info = StreamInfo {
                status,
                local_addr: session.local_addr(id).map(|a| a.to_string()),
                stats: stats.get(&id).copied().unwrap_or_default(),
            };
            (id, info)
        })
        .collect();

    Json(StatusResponse {
        transport: session.transport_mode(),
        toggle: ToggleInfo {
            local: toggle.local,
            remote: toggle.remote,
            overlay_active: toggle.overlay_active(),
            remote_age_ms: toggle
                .last_remote_update
                .map(|t| t.elapsed().as_millis() as u64),
        },
        render_mode: session.render_mode(),
        streams,
    })
}

// ── /daemon/shutdown ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    state.session.shutdown();

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
