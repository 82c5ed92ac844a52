//! Overlay toggle replication.
//!
//! `local` is written only by the command surface, `remote` only by the
//! state receive path. Each lives in its own `watch` channel so readers
//! always get a point-in-time snapshot without locking.
//!
//! Delivery is best effort: the current local value is pushed on every
//! change and re-sent every `resend_interval`, so a lost update heals
//! within one interval. Received values are applied last-write-wins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};

use tandem_core::wire::StateDatagram;
use tandem_core::StreamId;

use crate::mux::StreamMultiplexer;

/// Snapshot of both sides of the toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToggleState {
    pub local: bool,
    pub remote: bool,
    /// When the peer's value was last received, if ever.
    pub last_remote_update: Option<Instant>,
}

impl ToggleState {
    pub fn overlay_active(&self) -> bool {
        self.local && self.remote
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RemoteValue {
    value: bool,
    updated_at: Option<Instant>,
}

#[derive(Debug)]
pub struct StateSynchronizer {
    local: watch::Sender<bool>,
    remote: watch::Sender<RemoteValue>,
    resend_interval: Duration,
}

impl StateSynchronizer {
    pub fn new(resend_interval: Duration) -> Self {
        Self {
            local: watch::Sender::new(false),
            remote: watch::Sender::new(RemoteValue::default()),
            resend_interval,
        }
    }

    pub fn snapshot(&self) -> ToggleState {
        let remote = *self.remote.borrow();
        ToggleState {
            local: *self.local.borrow(),
            remote: remote.value,
            last_remote_update: remote.updated_at,
        }
    }

    // ── Command surface ─────────────────────────────────────────────────────

    /// Set the local toggle. Returns true if the value changed.
    pub fn set_local(&self, value: bool) -> bool {
        let changed = self.local.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
        if changed {
            tracing::info!(local = value, "overlay toggle set");
        }
        changed
    }

    /// Flip the local toggle and return the new value.
    pub fn toggle_local(&self) -> bool {
        let mut value = false;
        self.local.send_modify(|current| {
            *current = !*current;
            value = *current;
        });
        tracing::info!(local = value, "overlay toggle flipped");
        value
    }

    // ── Receive path ────────────────────────────────────────────────────────

    /// Apply a peer update. Watchers are only woken if the value changed.
    pub fn apply_remote(&self, update: StateDatagram, now: Instant) {
        let changed = self.remote.send_if_modified(|r| {
            let changed = r.value != update.overlay;
            r.value = update.overlay;
            r.updated_at = Some(now);
            changed
        });
        if changed {
            tracing::info!(remote = update.overlay, "peer overlay toggle changed");
        }
    }

    /// Resolves whenever either side of the toggle changes.
    pub fn subscribe(&self) -> ToggleWatch {
        ToggleWatch {
            local: self.local.subscribe(),
            remote: self.remote.subscribe(),
        }
    }

    // ── Send path ───────────────────────────────────────────────────────────

    /// Push the local value on every change and on every resend tick until
    /// shutdown. Send failures are logged and retried on the next tick.
    pub async fn send_loop(
        self: Arc<Self>,
        mux: Arc<StreamMultiplexer>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut changes = self.local.subscribe();
        let mut resend = tokio::time::interval(self.resend_interval);
        resend.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("state sync loop shutting down");
                    return;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    self.push(&mux).await;
                    resend.reset();
                }
                _ = resend.tick() => self.push(&mux).await,
            }
        }
    }

    async fn push(&self, mux: &StreamMultiplexer) {
        let datagram = StateDatagram {
            overlay: *self.local.borrow(),
        };
        if let Err(e) = mux.send_datagram(StreamId::State, &datagram.encode()).await {
            tracing::debug!(error = %e, "state push failed");
        }
    }
}

/// Change notifications for both sides of the toggle.
pub struct ToggleWatch {
    local: watch::Receiver<bool>,
    remote: watch::Receiver<RemoteValue>,
}

impl ToggleWatch {
    /// Wait for the next change on either side. Returns false once the
    /// synchronizer is gone.
    pub async fn changed(&mut self) -> bool {
        tokio::select! {
            r = self.local.changed() => r.is_ok(),
            r = self.remote.changed() => r.is_ok(),
        }
    }
}
