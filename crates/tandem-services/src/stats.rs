//! Per-stream counters — what arrived, what was dropped, and why.
//!
//! Drops on the receive path are expected under loss and reordering, so they
//! are counted rather than surfaced as errors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use tandem_core::StreamId;

/// Lock-free counters for one stream.
#[derive(Debug, Default)]
pub struct StreamStats {
    chunks_sent: AtomicU64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    outbox_dropped: AtomicU64,
    gated: AtomicU64,
    datagrams_received: AtomicU64,
    frames_completed: AtomicU64,
    malformed: AtomicU64,
    stale: AtomicU64,
    superseded: AtomicU64,
    timed_out: AtomicU64,
}

/// Point-in-time copy of a stream's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub chunks_sent: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub outbox_dropped: u64,
    pub gated: u64,
    pub datagrams_received: u64,
    pub frames_completed: u64,
    pub malformed: u64,
    pub stale: u64,
    pub superseded: u64,
    pub timed_out: u64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl StreamStats {
    counter!(record_frame_sent, frames_sent);
    counter!(record_send_failure, send_failures);
    counter!(record_outbox_drop, outbox_dropped);
    counter!(record_gated, gated);
    counter!(record_datagram, datagrams_received);
    counter!(record_completed, frames_completed);
    counter!(record_malformed, malformed);
    counter!(record_stale, stale);
    counter!(record_superseded, superseded);
    counter!(record_timed_out, timed_out);

    pub fn record_chunks_sent(&self, n: usize) {
        self.chunks_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            chunks_sent: load(&self.chunks_sent),
            frames_sent: load(&self.frames_sent),
            send_failures: load(&self.send_failures),
            outbox_dropped: load(&self.outbox_dropped),
            gated: load(&self.gated),
            datagrams_received: load(&self.datagrams_received),
            frames_completed: load(&self.frames_completed),
            malformed: load(&self.malformed),
            stale: load(&self.stale),
            superseded: load(&self.superseded),
            timed_out: load(&self.timed_out),
        }
    }
}

/// Counters for every stream in a session, shared across tasks.
#[derive(Debug, Clone, Default)]
pub struct StatsRegistry {
    streams: Arc<DashMap<StreamId, Arc<StreamStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `stream_id`, created on first use.
    pub fn stream(&self, stream_id: StreamId) -> Arc<StreamStats> {
        self.streams.entry(stream_id).or_default().clone()
    }

    pub fn snapshot(&self) -> BTreeMap<StreamId, StatsSnapshot> {
        self.streams
            .iter()
            .map(|e| (*e.key(), e.value().snapshot()))
            .collect()
    }

    /// Log counters for streams that have seen any traffic.
    pub fn log_stats(&self) {
        for (stream, s) in self.snapshot() {
            if s == StatsSnapshot::default() {
                continue;
            }
            tracing::info!(
                %stream,
                frames_sent = s.frames_sent,
                chunks_sent = s.chunks_sent,
                frames_completed = s.frames_completed,
                datagrams = s.datagrams_received,
                malformed = s.malformed,
                stale = s.stale,
                superseded = s.superseded,
                timed_out = s.timed_out,
                outbox_dropped = s.outbox_dropped,
                send_failures = s.send_failures,
                "stream stats"
            );
        }
    }
}
