//! Logging sink — stands in for a display and speaker.

use std::sync::atomic::{AtomicU64, Ordering};

use tandem_services::{Frame, MediaSink, RenderDecision};

#[derive(Debug, Default)]
pub struct LogSink {
    rendered: AtomicU64,
    played: AtomicU64,
}

/// Log every Nth render so a 15 fps stream doesn't flood the output.
const LOG_EVERY: u64 = 30;

impl MediaSink for LogSink {
    fn render(&self, decision: &RenderDecision) {
        let n = self.rendered.fetch_add(1, Ordering::Relaxed);
        if n % LOG_EVERY == 0 {
            tracing::info!(
                mode = ?decision.mode,
                frame_id = decision.primary.frame_id,
                bytes = decision.primary.payload.len(),
                secondary = ?decision.secondary.as_ref().map(|f| f.frame_id),
                rendered = n + 1,
                "render"
            );
        }
    }

    fn play(&self, frame: &Frame) {
        let n = self.played.fetch_add(1, Ordering::Relaxed);
        if n % LOG_EVERY == 0 {
            tracing::debug!(frame_id = frame.frame_id, bytes = frame.payload.len(), "audio");
        }
    }

    fn control(&self, values: &[f32]) {
        tracing::info!(?values, "control values received");
    }
}
