//! Node abstraction.
//!
//! # Responsibilities
//! - Represent one tracked endpoint under a logical key
//! - Own the node's backoff state and bad-call counter
//! - Lazily open, share and finally close the node's connection
//! - Track calls in flight so close can drain them

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::health::state::HealthState;
use crate::network::endpoint::Endpoint;
use crate::network::types::NodeKey;
use crate::transport::in_flight::{CallGuard, InFlightTracker};
use crate::transport::{Connection, Transport, TransportError};

static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// How a node's connection was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// In-flight calls drained and the connection shut down in time.
    Graceful,
    /// The timeout elapsed and the connection was aborted.
    Forced,
    AlreadyClosed,
}

/// A single tracked endpoint.
pub struct Node<K, T: Transport> {
    id: u64,
    key: K,
    endpoint: Endpoint,
    transport: Arc<T>,
    health: Mutex<HealthState>,
    bad_calls: AtomicU64,
    connection: tokio::sync::Mutex<Option<Arc<T::Connection>>>,
    in_flight: InFlightTracker,
    closed: AtomicBool,
}

impl<K: NodeKey, T: Transport> Node<K, T> {
    pub fn new(
        key: K,
        endpoint: Endpoint,
        transport: Arc<T>,
        min_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self::with_state(
            key,
            endpoint,
            transport,
            HealthState::new(min_backoff, max_backoff, Instant::now()),
            0,
        )
    }

    fn with_state(
        key: K,
        endpoint: Endpoint,
        transport: Arc<T>,
        health: HealthState,
        bad_calls: u64,
    ) -> Self {
        Self {
            id: NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            key,
            endpoint,
            transport,
            health: Mutex::new(health),
            bad_calls: AtomicU64::new(bad_calls),
            connection: tokio::sync::Mutex::new(None),
            in_flight: InFlightTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Fresh node on `endpoint` carrying over this node's health and bad-call count.
    pub fn rebuild(&self, endpoint: Endpoint) -> Self {
        Self::with_state(
            self.key.clone(),
            endpoint,
            Arc::clone(&self.transport),
            self.health().clone(),
            self.bad_call_count(),
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// `key@host:port`, used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}@{}", self.key, self.endpoint)
    }

    fn health(&self) -> MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Health ---

    pub fn is_healthy(&self, now: Instant) -> bool {
        self.health().is_healthy(now)
    }

    /// Retryable failure observed on this node.
    pub fn increase_backoff(&self, now: Instant) {
        self.bad_calls.fetch_add(1, Ordering::Relaxed);
        self.health().increase(now);
    }

    /// Success observed on this node.
    pub fn decrease_backoff(&self) {
        self.health().decrease();
    }

    pub fn bad_call_count(&self) -> u64 {
        self.bad_calls.load(Ordering::Relaxed)
    }

    pub fn current_backoff(&self) -> Duration {
        self.health().current_backoff()
    }

    pub fn readmit_time(&self) -> Instant {
        self.health().readmit_time()
    }

    pub fn remaining_backoff(&self, now: Instant) -> Duration {
        self.health().remaining(now)
    }

    pub fn set_backoff_bounds(&self, min_backoff: Duration, max_backoff: Duration) {
        let mut health = self.health();
        health.set_min_backoff(min_backoff);
        health.set_max_backoff(max_backoff);
    }

    pub fn reset_readmit(&self, now: Instant) {
        self.health().set_readmit_time(now);
    }

    // --- Connection ---

    /// Return the node's connection, opening it on first use.
    pub async fn get_connection(&self) -> Result<Arc<T::Connection>, TransportError> {
        let mut slot = self.connection.lock().await;
        if self.is_closed() {
            return Err(TransportError::unavailable(format!(
                "node {} is closed",
                self.label()
            )));
        }
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let conn = Arc::new(self.transport.connect(&self.endpoint).await?);
        if self.is_closed() {
            conn.abort();
            return Err(TransportError::unavailable(format!(
                "node {} closed while connecting",
                self.label()
            )));
        }

        tracing::debug!(node = %self.label(), "Connection opened");
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Whether a connection is open right now. Reports `false` while the
    /// slot is busy, since a first connect may still be in progress.
    pub fn has_connection(&self) -> bool {
        self.connection
            .try_lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Mark one call as in flight until the guard drops.
    pub fn begin_call(&self) -> CallGuard {
        self.in_flight.track()
    }

    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.active_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the connection, waiting at most `timeout` for in-flight calls.
    ///
    /// The connection is gone when this returns; if the wait times out it is aborted.
    pub async fn close(&self, timeout: Duration) -> CloseOutcome {
        if self.closed.swap(true, Ordering::SeqCst) {
            return CloseOutcome::AlreadyClosed;
        }

        let conn = match tokio::time::timeout(timeout, self.connection.lock()).await {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                tracing::warn!(node = %self.label(), "Connection slot busy past close timeout");
                return CloseOutcome::Forced;
            }
        };
        let Some(conn) = conn else {
            return CloseOutcome::Graceful;
        };

        let drain = async {
            self.in_flight.wait_idle().await;
            conn.shutdown().await;
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                tracing::debug!(node = %self.label(), "Connection closed");
                CloseOutcome::Graceful
            }
            Err(_) => {
                conn.abort();
                tracing::warn!(
                    node = %self.label(),
                    in_flight = self.in_flight.active_count(),
                    "Close timed out, connection aborted"
                );
                CloseOutcome::Forced
            }
        }
    }

    pub fn snapshot(&self, now: Instant) -> NodeSnapshot {
        let health = self.health();
        NodeSnapshot {
            key: self.key.to_string(),
            endpoint: self.endpoint.to_string(),
            healthy: health.is_healthy(now),
            current_backoff_ms: health.current_backoff().as_millis() as u64,
            readmit_in_ms: health.remaining(now).as_millis() as u64,
            bad_calls: self.bad_call_count(),
            in_flight: self.in_flight.active_count(),
        }
    }
}

impl<K: NodeKey, T: Transport> fmt::Debug for Node<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("endpoint", &self.endpoint)
            .field("bad_calls", &self.bad_call_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Serializable view of one node's health.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub key: String,
    pub endpoint: String,
    pub healthy: bool,
    pub current_backoff_ms: u64,
    pub readmit_in_ms: u64,
    pub bad_calls: u64,
    pub in_flight: u64,
}
