//! Frame reassembly — accumulates chunks of the newest frame on one stream.
//!
//! At most one frame is in flight per stream. A chunk for a newer frame
//! discards whatever is buffered, complete or not; a chunk for an older
//! frame is dropped. Memory per stream is therefore bounded by a single
//! frame, and a stalled frame never delays a fresher one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use tandem_core::{is_newer, Chunk, StreamId};

use crate::frame::Frame;
use crate::stats::StreamStats;

/// Silence, in multiples of the frame timeout, after which the newest
/// frame id is forgotten.
const RESYNC_FACTOR: u32 = 4;

/// Why a chunk was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    /// The chunk belongs to a frame older than (or already finished
    /// before) the newest one seen on this stream.
    #[error("stale chunk for frame {frame_id} (newest {newest})")]
    StaleChunk { frame_id: u32, newest: u32 },

    /// The chunk disagrees with the buffered frame's chunk count.
    #[error("chunk count {got} does not match buffered frame's {expected}")]
    InconsistentChunk { expected: u16, got: u16 },

    #[error("chunk index {index} out of range for count {count}")]
    IndexOutOfRange { index: u16, count: u16 },

    #[error("chunk for stream {got} fed to {expected} reassembler")]
    WrongStream { expected: StreamId, got: StreamId },
}

/// In-progress frame.
#[derive(Debug)]
struct ReassemblyBuffer {
    frame_id: u32,
    chunk_count: u16,
    received: usize,
    slots: Vec<Option<Bytes>>,
    created_at: Instant,
    updated_at: Instant,
}

impl ReassemblyBuffer {
    fn new(frame_id: u32, chunk_count: u16, now: Instant) -> Self {
        Self {
            frame_id,
            chunk_count,
            received: 0,
            slots: vec![None; usize::from(chunk_count)],
            created_at: now,
            updated_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == usize::from(self.chunk_count)
    }

    fn concat(self) -> Bytes {
        let total = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for slot in self.slots.into_iter().flatten() {
            out.put(slot);
        }
        out.freeze()
    }
}

/// Per-stream reassembler. Never shared between streams.
#[derive(Debug)]
pub struct FrameReassembler {
    stream_id: StreamId,
    timeout: Duration,
    buffer: Option<ReassemblyBuffer>,
    /// Newest frame id accepted on this stream, buffered or not.
    newest: Option<u32>,
    last_accepted: Option<Instant>,
    stats: Arc<StreamStats>,
}

impl FrameReassembler {
    pub fn new(stream_id: StreamId, timeout: Duration) -> Self {
        Self::with_stats(stream_id, timeout, Arc::default())
    }

    pub fn with_stats(stream_id: StreamId, timeout: Duration, stats: Arc<StreamStats>) -> Self {
        Self {
            stream_id,
            timeout,
            buffer: None,
            newest: None,
            last_accepted: None,
            stats,
        }
    }

    /// Frame id of the buffer currently being filled, if any.
    pub fn current_frame_id(&self) -> Option<u32> {
        self.buffer.as_ref().map(|b| b.frame_id)
    }

    /// Number of chunks buffered for the in-progress frame.
    pub fn buffered_chunks(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.received)
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Feed one chunk. Returns the completed frame when this chunk was the
    /// last one missing.
    pub fn ingest(&mut self, chunk: Chunk, now: Instant) -> Result<Option<Frame>, ReassemblyError> {
        if chunk.stream_id != self.stream_id {
            return Err(ReassemblyError::WrongStream {
                expected: self.stream_id,
                got: chunk.stream_id,
            });
        }

        // A stream silent for several timeouts may come back with a
        // restarted counter; forget the old high-water mark.
        if self
            .last_accepted
            .is_some_and(|t| now.saturating_duration_since(t) > self.timeout * RESYNC_FACTOR)
        {
            if self.buffer.take().is_some() {
                self.stats.record_timed_out();
            }
            self.newest = None;
        }

        match self.newest {
            Some(newest) if chunk.frame_id == newest => {}
            Some(newest) if !is_newer(chunk.frame_id, newest) => {
                self.stats.record_stale();
                return Err(ReassemblyError::StaleChunk {
                    frame_id: chunk.frame_id,
                    newest,
                });
            }
            _ => {
                if let Some(old) = self.buffer.take() {
                    tracing::debug!(
                        stream = %self.stream_id,
                        dropped = old.frame_id,
                        received = old.received,
                        chunk_count = old.chunk_count,
                        next = chunk.frame_id,
                        "incomplete frame superseded"
                    );
                    self.stats.record_superseded();
                }
                self.newest = Some(chunk.frame_id);
                self.buffer = Some(ReassemblyBuffer::new(chunk.frame_id, chunk.chunk_count, now));
            }
        }

        // Newest frame already completed or purged: late duplicates are stale.
        let Some(buffer) = self.buffer.as_mut() else {
            self.stats.record_stale();
            return Err(ReassemblyError::StaleChunk {
                frame_id: chunk.frame_id,
                newest: chunk.frame_id,
            });
        };

        if chunk.chunk_count != buffer.chunk_count {
            return Err(ReassemblyError::InconsistentChunk {
                expected: buffer.chunk_count,
                got: chunk.chunk_count,
            });
        }

        let count = buffer.chunk_count;
        let Some(slot) = buffer.slots.get_mut(usize::from(chunk.chunk_index)) else {
            return Err(ReassemblyError::IndexOutOfRange {
                index: chunk.chunk_index,
                count,
            });
        };
        if slot.is_none() {
            buffer.received += 1;
        }
        *slot = Some(chunk.data);
        buffer.updated_at = now;
        self.last_accepted = Some(now);

        if !buffer.is_complete() {
            return Ok(None);
        }

        let Some(done) = self.buffer.take() else {
            return Ok(None);
        };
        let frame_id = done.frame_id;
        let assembly_time = now.saturating_duration_since(done.created_at);
        let payload = done.concat();
        self.stats.record_completed();
        tracing::trace!(
            stream = %self.stream_id,
            frame_id,
            bytes = payload.len(),
            assembly_us = assembly_time.as_micros() as u64,
            "frame completed"
        );
        Ok(Some(Frame {
            stream_id: self.stream_id,
            frame_id,
            payload,
            produced_at: now,
        }))
    }

    /// Drop the in-progress buffer if no chunk has arrived for longer than
    /// the timeout. Returns the purged frame id. Never emits a frame.
    pub fn purge_expired(&mut self, now: Instant) -> Option<u32> {
        let expired = self
            .buffer
            .as_ref()
            .is_some_and(|b| now.saturating_duration_since(b.updated_at) > self.timeout);
        if !expired {
            return None;
        }
        let buffer = self.buffer.take()?;
        self.stats.record_timed_out();
        tracing::debug!(
            stream = %self.stream_id,
            frame_id = buffer.frame_id,
            received = buffer.received,
            chunk_count = buffer.chunk_count,
            "incomplete frame timed out"
        );
        Some(buffer.frame_id)
    }
}
