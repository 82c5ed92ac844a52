//! Overlay session — decides what the renderer shows.
//!
//! Level-triggered: every new frame or toggle change re-evaluates from the
//! current inputs, so a missed transition corrects itself on the next
//! evaluation without any handshake between peers.

use serde::Serialize;

use tandem_core::StreamId;

use crate::frame::Frame;
use crate::toggle::ToggleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    SoloFront,
    SoloBack,
    Blending,
}

/// One render tick's instructions.
#[derive(Debug, Clone)]
pub struct RenderDecision {
    pub mode: RenderMode,
    pub primary: Frame,
    /// Present only in `Blending`.
    pub secondary: Option<Frame>,
    /// Weight of `secondary`; `primary` gets `1 - alpha`.
    pub alpha: f32,
}

#[derive(Debug)]
pub struct OverlaySession {
    alpha: f32,
    toggle: ToggleState,
    local_front: Option<Frame>,
    remote_front: Option<Frame>,
    remote_back: Option<Frame>,
    last_mode: Option<RenderMode>,
}

impl OverlaySession {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            toggle: ToggleState::default(),
            local_front: None,
            remote_front: None,
            remote_back: None,
            last_mode: None,
        }
    }

    /// Whether frames for `stream` should be transmitted at all. The back
    /// camera is only useful to the peer while both sides want the overlay.
    pub fn should_send(stream: StreamId, toggle: &ToggleState) -> bool {
        match stream {
            StreamId::Back => toggle.overlay_active(),
            _ => true,
        }
    }

    pub fn last_mode(&self) -> Option<RenderMode> {
        self.last_mode
    }

    /// Record a frame reassembled from the peer. Returns false when the
    /// frame is not kept: audio, or a back frame that arrives while the
    /// overlay is inactive (in flight across a deactivation).
    pub fn on_frame(&mut self, frame: Frame) -> bool {
        match frame.stream_id {
            StreamId::Front => self.remote_front = Some(frame),
            StreamId::Back if self.toggle.overlay_active() => self.remote_back = Some(frame),
            StreamId::Back => {
                tracing::debug!(frame_id = frame.frame_id, "back frame dropped, overlay inactive");
                return false;
            }
            _ => return false,
        }
        true
    }

    /// Record the newest locally captured front frame.
    pub fn on_local_frame(&mut self, frame: Frame) {
        if frame.stream_id == StreamId::Front {
            self.local_front = Some(frame);
        }
    }

    pub fn on_toggle(&mut self, toggle: ToggleState) {
        if !toggle.overlay_active() {
            self.remote_back = None;
        }
        self.toggle = toggle;
    }

    /// Compute the current render decision. `None` until there is anything
    /// to show.
    pub fn evaluate(&mut self) -> Option<RenderDecision> {
        let decision = if self.toggle.overlay_active() {
            match (&self.local_front, &self.remote_back) {
                (Some(front), Some(back)) => RenderDecision {
                    mode: RenderMode::Blending,
                    primary: front.clone(),
                    secondary: Some(back.clone()),
                    alpha: self.alpha,
                },
                (None, Some(back)) => self.solo(RenderMode::SoloBack, back.clone()),
                (Some(front), None) => self.solo(RenderMode::SoloFront, front.clone()),
                (None, None) => {
                    let front = self.remote_front.clone()?;
                    self.solo(RenderMode::SoloFront, front)
                }
            }
        } else {
            let front = self.remote_front.clone()?;
            self.solo(RenderMode::SoloFront, front)
        };

        if self.last_mode != Some(decision.mode) {
            tracing::info!(
                mode = ?decision.mode,
                local = self.toggle.local,
                remote = self.toggle.remote,
                "render mode changed"
            );
            self.last_mode = Some(decision.mode);
        }
        Some(decision)
    }

    fn solo(&self, mode: RenderMode, frame: Frame) -> RenderDecision {
        RenderDecision {
            mode,
            primary: frame,
            secondary: None,
            alpha: self.alpha,
        }
    }
}

/// Weighted mix of two decoded pixel buffers, `primary * (1 - alpha) +
/// secondary * alpha`, saturating per byte. Bytes of `primary` past the end
/// of `secondary` are copied unchanged.
pub fn blend(primary: &[u8], secondary: &[u8], alpha: f32) -> Vec<u8> {
    let a = alpha.clamp(0.0, 1.0);
    primary
        .iter()
        .enumerate()
        .map(|(i, &p)| match secondary.get(i) {
            Some(&s) => {
                let v = f32::from(p) * (1.0 - a) + f32::from(s) * a;
                v.round().clamp(0.0, 255.0) as u8
            }
            None => p,
        })
        .collect()
}
