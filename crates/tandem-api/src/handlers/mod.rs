//! HTTP API handlers — session state as JSON, and the command surface.

pub mod overlay;
pub mod status;

use std::sync::Arc;

use tandem_services::PeerSession;

#[derive(Clone)]
pub struct ApiState {
    pub session: Arc<PeerSession>,
}

pub use overlay::{handle_control, handle_overlay_set, handle_overlay_toggle, handle_stream_reopen};
pub use status::{handle_shutdown, handle_status};
