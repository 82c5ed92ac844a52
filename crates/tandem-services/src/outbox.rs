//! Outbound frame queue — bounded, drop-oldest.
//!
//! Capture never waits on the network. When the send task falls behind,
//! the oldest queued frame is discarded to make room for the new one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    depth: usize,
}

/// Shared handle; clones push into and pop from the same queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    inner: Arc<Inner>,
}

impl Outbox {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(depth.max(1))),
                notify: Notify::new(),
                depth: depth.max(1),
            }),
        }
    }

    /// Queue a payload. Returns true if an older payload was dropped.
    pub fn push(&self, payload: Bytes) -> bool {
        let dropped = {
            let mut q = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let dropped = if q.len() >= self.inner.depth {
                q.pop_front().is_some()
            } else {
                false
            };
            q.push_back(payload);
            dropped
        };
        self.inner.notify.notify_one();
        dropped
    }

    /// Wait for the next payload.
    pub async fn pop(&self) -> Bytes {
        loop {
            if let Some(p) = self.try_pop() {
                return p;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
