//! Frame types — the unit handed between capture, transport and render.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::watch;

use tandem_core::StreamId;

/// One complete unit of encoded media (a video image or an audio buffer).
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_id: u32,
    /// Opaque encoded bytes. The transport never looks inside.
    pub payload: Bytes,
    /// When the frame was submitted (sender) or completed (receiver).
    pub produced_at: Instant,
}

impl Frame {
    pub fn new(stream_id: StreamId, frame_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_id,
            payload,
            produced_at: Instant::now(),
        }
    }
}

/// Newest completed frame per media stream.
///
/// The receive path is the only writer. A frame that is overwritten before
/// the render task looks at it is never shown, so a slow renderer always
/// catches up to the freshest frame instead of working through a backlog.
#[derive(Debug)]
pub struct LatestFrames {
    slots: HashMap<StreamId, watch::Sender<Option<Frame>>>,
}

impl LatestFrames {
    pub fn new() -> Self {
        Self {
            slots: StreamId::MEDIA
                .iter()
                .map(|&id| (id, watch::Sender::new(None)))
                .collect(),
        }
    }

    /// Replace the stream's newest frame. Returns false for streams that
    /// carry no frames.
    pub fn publish(&self, frame: Frame) -> bool {
        match self.slots.get(&frame.stream_id) {
            Some(slot) => {
                slot.send_replace(Some(frame));
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self, stream_id: StreamId) -> Option<watch::Receiver<Option<Frame>>> {
        self.slots.get(&stream_id).map(watch::Sender::subscribe)
    }
}

impl Default for LatestFrames {
    fn default() -> Self {
        Self::new()
    }
}
