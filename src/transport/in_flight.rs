//! In-flight call tracking.
//!
//! # Responsibilities
//! - Count calls currently running against a node's connection
//! - Give each call an ID for tracing
//! - Let `Node::close` wait for the count to drain before shutting the connection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Relaxed is enough here, the counter only has to hand out unique values.
static CALL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

impl CallId {
    pub fn new() -> Self {
        Self(CALL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Tracks calls in flight on one node.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    active: Arc<AtomicU64>,
    idle: Arc<Notify>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new call. The returned guard ends it on drop.
    pub fn track(&self) -> CallGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        CallGuard {
            active: Arc::clone(&self.active),
            idle: Arc::clone(&self.idle),
            id: CallId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until no call is in flight.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a guard dropped in between still wakes us.
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard for one in-flight call.
#[derive(Debug)]
pub struct CallGuard {
    active: Arc<AtomicU64>,
    idle: Arc<Notify>,
    id: CallId,
}

impl CallGuard {
    pub fn id(&self) -> CallId {
        self.id
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        tracing::trace!(call_id = %self.id, "Call finished");
    }
}
