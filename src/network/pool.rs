//! Node pool management.
//!
//! # Responsibilities
//! - Own every node, the healthy subset and the key → nodes index
//! - Select nodes for outgoing calls (random healthy, or distinct-key fan-out)
//! - Apply backoff feedback and readmit nodes once their timers pass
//! - Evict nodes that keep failing, and drain everything on close
//!
//! All three indices live in one `Topology` behind one async mutex, so
//! selection never sees a half-applied change. Per-node health has its own
//! guard inside `Node`.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::health::readmission::ReadmitSchedule;
use crate::network::node::{CloseOutcome, Node, NodeSnapshot};
use crate::network::random::RandomSelector;
use crate::network::types::{NetworkError, NetworkResult, NodeKey};
use crate::observability::metrics;
use crate::transport::Transport;

/// Tunables of a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub min_node_backoff: Duration,
    pub max_node_backoff: Duration,
    pub min_readmit: Duration,
    pub max_readmit: Duration,
    /// Bad calls before a node is evicted. 0 disables eviction.
    pub max_node_attempts: u64,
    pub close_timeout: Duration,
    pub transport_security: bool,
    pub max_nodes_per_request: Option<usize>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_node_backoff: Duration::from_secs(8),
            max_node_backoff: Duration::from_secs(3600),
            min_readmit: Duration::from_secs(8),
            max_readmit: Duration::from_secs(3600),
            max_node_attempts: 0,
            close_timeout: Duration::from_secs(30),
            transport_security: false,
            max_nodes_per_request: None,
        }
    }
}

pub(super) struct Topology<K, T: Transport> {
    pub(super) nodes: Vec<Arc<Node<K, T>>>,
    pub(super) healthy: Vec<Arc<Node<K, T>>>,
    pub(super) by_key: HashMap<K, Vec<Arc<Node<K, T>>>>,
    pub(super) schedule: ReadmitSchedule,
    pub(super) selector: RandomSelector,
    pub(super) settings: PoolSettings,
    pub(super) closed: bool,
}

impl<K: NodeKey, T: Transport> Topology<K, T> {
    /// Rebuild `healthy` from the node list if the schedule says a sweep is due.
    fn readmit(&mut self, now: Instant) {
        if !self.schedule.is_due(now) {
            return;
        }

        self.healthy = self
            .nodes
            .iter()
            .filter(|n| n.is_healthy(now))
            .cloned()
            .collect();
        let pending = self
            .nodes
            .iter()
            .map(|n| n.readmit_time())
            .filter(|t| *t > now);
        self.schedule.reschedule(now, pending);

        tracing::trace!(
            healthy = self.healthy.len(),
            total = self.nodes.len(),
            next_sweep_in_ms = self.schedule.earliest().saturating_duration_since(now).as_millis() as u64,
            "Readmission sweep"
        );
        metrics::record_nodes(self.nodes.len(), self.healthy.len());
    }

    /// Remove nodes over the bad-call threshold from every index. The caller closes them.
    fn evict(&mut self) -> Vec<Arc<Node<K, T>>> {
        let threshold = self.settings.max_node_attempts;
        if threshold == 0 {
            return Vec::new();
        }

        let (dead, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.nodes)
            .into_iter()
            .partition(|n| n.bad_call_count() >= threshold);
        self.nodes = alive;
        for node in &dead {
            self.unindex(node);
            tracing::info!(
                node = %node.label(),
                bad_calls = node.bad_call_count(),
                "Evicting node"
            );
        }
        if !dead.is_empty() {
            metrics::record_eviction(dead.len());
            metrics::record_nodes(self.nodes.len(), self.healthy.len());
        }
        dead
    }

    /// Drop a node from `healthy` and `by_key`. `nodes` is left to the caller.
    pub(super) fn unindex(&mut self, node: &Arc<Node<K, T>>) {
        self.healthy.retain(|n| n.id() != node.id());
        if let Some(list) = self.by_key.get_mut(node.key()) {
            list.retain(|n| n.id() != node.id());
            if list.is_empty() {
                self.by_key.remove(node.key());
            }
        }
    }

    pub(super) fn index(&mut self, node: Arc<Node<K, T>>) {
        self.by_key
            .entry(node.key().clone())
            .or_default()
            .push(Arc::clone(&node));
        self.healthy.push(Arc::clone(&node));
        self.nodes.push(node);
    }

    fn fan_out_default(&self) -> usize {
        let keys = self.by_key.len();
        match self.settings.max_nodes_per_request {
            Some(max) => max.min(keys),
            None => keys.div_ceil(3),
        }
    }
}

/// The set of nodes a client talks to.
pub struct NodePool<K, T: Transport> {
    pub(super) transport: Arc<T>,
    pub(super) topology: Mutex<Topology<K, T>>,
}

impl<K: NodeKey, T: Transport> NodePool<K, T> {
    /// Empty pool. Populate it with `reconcile`.
    pub fn new(transport: Arc<T>, settings: PoolSettings) -> Self {
        Self::with_selector(transport, settings, RandomSelector::from_entropy())
    }

    pub fn with_selector(transport: Arc<T>, settings: PoolSettings, selector: RandomSelector) -> Self {
        let schedule = ReadmitSchedule::new(settings.min_readmit, settings.max_readmit, Instant::now());
        Self {
            transport,
            topology: Mutex::new(Topology {
                nodes: Vec::new(),
                healthy: Vec::new(),
                by_key: HashMap::new(),
                schedule,
                selector,
                settings,
                closed: false,
            }),
        }
    }

    pub(super) async fn lock_open(&self) -> NetworkResult<MutexGuard<'_, Topology<K, T>>> {
        let topo = self.topology.lock().await;
        if topo.closed {
            return Err(NetworkError::Closed);
        }
        Ok(topo)
    }

    // --- Selection ---

    /// Uniformly random node from the healthy set.
    pub async fn pick_random_healthy_node(&self) -> NetworkResult<Arc<Node<K, T>>> {
        let (picked, dead) = {
            let mut guard = self.lock_open().await?;
            let topo = &mut *guard;
            let now = Instant::now();
            topo.readmit(now);
            let dead = topo.evict();

            let picked = match topo.selector.pick_index(topo.healthy.len()) {
                Some(idx) => Ok(Arc::clone(&topo.healthy[idx])),
                None => Err(NetworkError::NoHealthyNode),
            };
            (picked, dead)
        };
        self.close_evicted(dead).await;
        picked
    }

    /// Random healthy node, or when none is healthy the live node closest to
    /// readmission. The duration is how long that node still backs off.
    pub async fn pick_random_or_nearest(&self) -> NetworkResult<(Arc<Node<K, T>>, Duration)> {
        let (picked, dead) = {
            let mut guard = self.lock_open().await?;
            let topo = &mut *guard;
            let now = Instant::now();
            topo.readmit(now);
            let dead = topo.evict();

            let picked = match topo.selector.pick_index(topo.healthy.len()) {
                Some(idx) => Ok((Arc::clone(&topo.healthy[idx]), Duration::ZERO)),
                None => topo
                    .nodes
                    .iter()
                    .filter(|n| !n.is_closed())
                    .min_by_key(|n| n.remaining_backoff(now))
                    .map(|n| (Arc::clone(n), n.remaining_backoff(now)))
                    .ok_or(NetworkError::NoHealthyNode),
            };
            (picked, dead)
        };
        self.close_evicted(dead).await;
        picked
    }

    /// Up to `count` nodes with distinct keys.
    ///
    /// Healthy nodes come first, in random order. Keys with no healthy node
    /// are then covered by their node closest to readmission.
    pub async fn pick_most_healthy_nodes(&self, count: usize) -> NetworkResult<Vec<Arc<Node<K, T>>>> {
        let (picked, dead) = {
            let mut guard = self.lock_open().await?;
            let topo = &mut *guard;
            let now = Instant::now();
            topo.readmit(now);
            let dead = topo.evict();

            let count = count.min(topo.by_key.len());
            let mut picked: Vec<Arc<Node<K, T>>> = Vec::with_capacity(count);
            let mut keys: HashSet<K> = HashSet::with_capacity(count);

            let mut healthy = topo.healthy.clone();
            topo.selector.shuffle(&mut healthy);
            for node in healthy {
                if picked.len() >= count {
                    break;
                }
                if keys.insert(node.key().clone()) {
                    picked.push(node);
                }
            }

            if picked.len() < count {
                let mut fallback: Vec<Arc<Node<K, T>>> = Vec::new();
                for node in &topo.nodes {
                    if keys.contains(node.key()) {
                        continue;
                    }
                    match fallback.iter_mut().find(|f| f.key() == node.key()) {
                        Some(best) => {
                            if node.remaining_backoff(now) < best.remaining_backoff(now) {
                                *best = Arc::clone(node);
                            }
                        }
                        None => fallback.push(Arc::clone(node)),
                    }
                }
                fallback.sort_by_key(|n| n.remaining_backoff(now));
                for node in fallback {
                    if picked.len() >= count {
                        break;
                    }
                    keys.insert(node.key().clone());
                    picked.push(node);
                }
            }
            (picked, dead)
        };
        self.close_evicted(dead).await;
        Ok(picked)
    }

    /// Every node registered under `key`.
    pub async fn nodes_for_key(&self, key: &K) -> NetworkResult<Vec<Arc<Node<K, T>>>> {
        let topo = self.lock_open().await?;
        topo.by_key
            .get(key)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownKey(key.to_string()))
    }

    /// Healthiest node for `key`: a random healthy one, else the one closest to readmission.
    pub async fn node_for_key(&self, key: &K) -> NetworkResult<Arc<Node<K, T>>> {
        let mut guard = self.lock_open().await?;
        let topo = &mut *guard;
        let now = Instant::now();
        topo.readmit(now);

        let nodes = topo
            .by_key
            .get(key)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownKey(key.to_string()))?;
        let healthy: Vec<_> = nodes.iter().filter(|n| n.is_healthy(now)).cloned().collect();
        if let Some(idx) = topo.selector.pick_index(healthy.len()) {
            return Ok(Arc::clone(&healthy[idx]));
        }
        nodes
            .into_iter()
            .min_by_key(|n| n.remaining_backoff(now))
            .ok_or_else(|| NetworkError::UnknownKey(key.to_string()))
    }

    // --- Health feedback ---

    /// Retryable failure on `node`: back it off, take it out of rotation,
    /// and evict it if it crossed the bad-call threshold.
    pub async fn increase_backoff(&self, node: &Arc<Node<K, T>>) {
        let now = Instant::now();
        node.increase_backoff(now);
        metrics::record_node_backoff(&node.endpoint().to_string(), node.current_backoff());

        let dead = {
            let mut guard = self.topology.lock().await;
            let topo = &mut *guard;
            if topo.closed {
                return;
            }
            topo.healthy.retain(|n| n.id() != node.id());
            topo.schedule.note_readmit(node.readmit_time());
            metrics::record_nodes(topo.nodes.len(), topo.healthy.len());
            topo.evict()
        };
        self.close_evicted(dead).await;
    }

    /// Success on `node`. Membership is unaffected.
    pub fn decrease_backoff(&self, node: &Arc<Node<K, T>>) {
        node.decrease_backoff();
        metrics::record_node_backoff(&node.endpoint().to_string(), node.current_backoff());
    }

    // --- Maintenance ---

    /// Run the readmission sweep now if it is due.
    pub async fn readmit_nodes(&self) -> NetworkResult<()> {
        let mut topo = self.lock_open().await?;
        topo.readmit(Instant::now());
        Ok(())
    }

    /// Evict and close every node over the bad-call threshold. Returns how many went.
    pub async fn evict_dead_nodes(&self) -> NetworkResult<usize> {
        let dead = {
            let mut topo = self.lock_open().await?;
            topo.evict()
        };
        let count = dead.len();
        self.close_evicted(dead).await;
        Ok(count)
    }

    async fn close_evicted(&self, dead: Vec<Arc<Node<K, T>>>) {
        if dead.is_empty() {
            return;
        }
        let timeout = self.topology.lock().await.settings.close_timeout;
        join_all(dead.iter().map(|n| n.close(timeout))).await;
    }

    /// Switch every node between its plain and TLS endpoint.
    ///
    /// Each node is closed and rebuilt on the mapped address with its health
    /// carried over; the healthy set is reset to all nodes.
    pub async fn set_transport_security(&self, secure: bool) -> NetworkResult<()> {
        let mut guard = self.lock_open().await?;
        let topo = &mut *guard;
        if topo.settings.transport_security == secure {
            return Ok(());
        }
        topo.settings.transport_security = secure;

        let timeout = topo.settings.close_timeout;
        let old = std::mem::take(&mut topo.nodes);
        join_all(old.iter().map(|n| n.close(timeout))).await;

        topo.healthy.clear();
        topo.by_key.clear();
        for node in &old {
            let endpoint = node.endpoint().with_transport_security(secure);
            topo.index(Arc::new(node.rebuild(endpoint)));
        }
        topo.healthy = topo.nodes.clone();
        topo.schedule.reset(Instant::now());

        tracing::info!(transport_security = secure, nodes = topo.nodes.len(), "Transport security changed");
        Ok(())
    }

    pub async fn transport_security(&self) -> bool {
        self.topology.lock().await.settings.transport_security
    }

    /// Change node backoff bounds for every current and future node.
    pub async fn set_node_backoff(&self, min: Duration, max: Duration) -> NetworkResult<()> {
        let mut topo = self.lock_open().await?;
        topo.settings.min_node_backoff = min;
        topo.settings.max_node_backoff = max.max(min);
        for node in &topo.nodes {
            node.set_backoff_bounds(min, max);
        }
        Ok(())
    }

    /// Change readmission bounds. Every node becomes eligible again.
    pub async fn set_readmit_bounds(&self, min: Duration, max: Duration) -> NetworkResult<()> {
        let mut guard = self.lock_open().await?;
        let topo = &mut *guard;
        let now = Instant::now();
        topo.settings.min_readmit = min;
        topo.settings.max_readmit = max.max(min);
        topo.schedule.set_bounds(min, max);
        for node in &topo.nodes {
            node.reset_readmit(now);
        }
        topo.healthy = topo.nodes.clone();
        topo.schedule.reschedule(now, std::iter::empty());
        Ok(())
    }

    /// Change the eviction threshold. 0 disables eviction.
    pub async fn set_max_node_attempts(&self, max: u64) -> NetworkResult<()> {
        self.lock_open().await?.settings.max_node_attempts = max;
        Ok(())
    }

    pub async fn set_close_timeout(&self, timeout: Duration) -> NetworkResult<()> {
        self.lock_open().await?.settings.close_timeout = timeout;
        Ok(())
    }

    pub async fn set_max_nodes_per_request(&self, max: Option<usize>) -> NetworkResult<()> {
        self.lock_open().await?.settings.max_nodes_per_request = max;
        Ok(())
    }

    pub async fn settings(&self) -> PoolSettings {
        self.topology.lock().await.settings.clone()
    }

    // --- Views ---

    /// Address → key map of the current network.
    pub async fn network(&self) -> HashMap<String, K> {
        let topo = self.topology.lock().await;
        topo.nodes
            .iter()
            .map(|n| (n.endpoint().to_string(), n.key().clone()))
            .collect()
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let topo = self.topology.lock().await;
        let now = Instant::now();
        PoolSnapshot {
            total: topo.nodes.len(),
            healthy: topo.healthy.len(),
            keys: topo.by_key.len(),
            closed: topo.closed,
            nodes: topo.nodes.iter().map(|n| n.snapshot(now)).collect(),
        }
    }

    pub async fn len(&self) -> usize {
        self.topology.lock().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn healthy_len(&self) -> usize {
        self.topology.lock().await.healthy.len()
    }

    pub async fn key_count(&self) -> usize {
        self.topology.lock().await.by_key.len()
    }

    /// Fan-out size used when a caller does not give one.
    pub async fn default_fan_out(&self) -> usize {
        self.topology.lock().await.fan_out_default()
    }

    // --- Lifecycle ---

    /// Close every node under one close-timeout deadline and empty the pool.
    ///
    /// Every connection is released on return. If any node had to be
    /// aborted the result is a `Timeout`. Later calls return `Ok`.
    pub async fn close(&self) -> NetworkResult<()> {
        let mut guard = self.topology.lock().await;
        let topo = &mut *guard;
        if topo.closed {
            return Ok(());
        }
        topo.closed = true;

        let deadline = Instant::now() + topo.settings.close_timeout;
        let nodes = std::mem::take(&mut topo.nodes);
        topo.healthy.clear();
        topo.by_key.clear();

        let outcomes = join_all(
            nodes
                .iter()
                .map(|n| n.close(deadline.saturating_duration_since(Instant::now()))),
        )
        .await;
        let forced = outcomes.iter().filter(|o| **o == CloseOutcome::Forced).count();
        metrics::record_nodes(0, 0);

        if forced > 0 {
            tracing::warn!(forced, total = nodes.len(), "Pool closed with forced connection aborts");
            return Err(NetworkError::Timeout(format!(
                "{} of {} nodes did not close in time",
                forced,
                nodes.len()
            )));
        }
        tracing::info!(total = nodes.len(), "Pool closed");
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.topology.lock().await.closed
    }
}

/// Serializable view of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub healthy: usize,
    pub keys: usize,
    pub closed: bool,
    pub nodes: Vec<NodeSnapshot>,
}
