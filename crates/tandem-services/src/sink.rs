//! Media sink — the renderer/player collaborator.
//!
//! The session hands a sink opaque payloads: decoding and display are the
//! sink's business.

use crate::frame::Frame;
use crate::overlay::RenderDecision;

/// Consumer of everything a session receives.
///
/// Calls come from the session's render task, one at a time. Implementations
/// should return quickly; a slow sink delays rendering, not the transport.
pub trait MediaSink: Send + Sync {
    /// Show a video decision (solo or blended).
    fn render(&self, decision: &RenderDecision);

    /// Play a completed audio frame.
    fn play(&self, frame: &Frame);

    /// Control values received from the peer.
    fn control(&self, _values: &[f32]) {}
}

/// Sink that discards everything. Useful for headless peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MediaSink for NullSink {
    fn render(&self, _decision: &RenderDecision) {}
    fn play(&self, _frame: &Frame) {}
}
