//! Runtime replacement of the node set.
//!
//! # Data Flow
//! ```text
//! desired [(key, endpoint)]
//!     → normalize endpoints to the pool's transport security
//!     → plan(): indices to remove (highest first) + entries to add
//!     → close removed nodes against one close-timeout budget
//!     → index new nodes as healthy
//! ```
//!
//! The topology lock is held for the whole call, so selection sees either
//! the old node set or the new one. A budget overrun stops the removal
//! loop with a timeout; removals already made are kept.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use crate::network::node::{CloseOutcome, Node};
use crate::network::pool::NodePool;
use crate::network::types::{NetworkEntry, NetworkError, NetworkResult, NodeKey};
use crate::observability::metrics;
use crate::transport::Transport;

/// What a reconciliation has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan<K> {
    /// Indices into the current node list, descending.
    pub remove: Vec<usize>,
    pub add: Vec<NetworkEntry<K>>,
}

impl<K> ReconcilePlan<K> {
    pub fn is_noop(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Diff the current (key, endpoint) pairs against the desired ones.
pub fn plan<K: NodeKey>(current: &[NetworkEntry<K>], desired: &[NetworkEntry<K>]) -> ReconcilePlan<K> {
    let wanted: HashSet<&NetworkEntry<K>> = desired.iter().collect();
    let present: HashSet<&NetworkEntry<K>> = current.iter().collect();

    let mut remove: Vec<usize> = current
        .iter()
        .enumerate()
        .filter(|(_, entry)| !wanted.contains(entry))
        .map(|(idx, _)| idx)
        .collect();
    remove.reverse();

    let mut seen = HashSet::new();
    let add = desired
        .iter()
        .filter(|entry| !present.contains(entry) && seen.insert(*entry))
        .cloned()
        .collect();

    ReconcilePlan { remove, add }
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    /// Removed nodes whose connection had to be aborted.
    pub forced_closes: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

impl<K: NodeKey, T: Transport> NodePool<K, T> {
    /// Make the pool's node set equal to `desired`.
    ///
    /// Nodes are matched on key and endpoint together; matching nodes keep
    /// their health and connection. Calling this twice with the same input
    /// changes nothing the second time.
    pub async fn reconcile(&self, desired: Vec<NetworkEntry<K>>) -> NetworkResult<ReconcileReport> {
        let mut guard = self.lock_open().await?;
        let topo = &mut *guard;

        let secure = topo.settings.transport_security;
        let desired: Vec<NetworkEntry<K>> = desired
            .into_iter()
            .map(|e| NetworkEntry::new(e.key, e.endpoint.with_transport_security(secure)))
            .collect();
        let current: Vec<NetworkEntry<K>> = topo
            .nodes
            .iter()
            .map(|n| NetworkEntry::new(n.key().clone(), n.endpoint().clone()))
            .collect();

        let plan = plan(&current, &desired);
        let mut report = ReconcileReport::default();
        if plan.is_noop() {
            return Ok(report);
        }

        let deadline = Instant::now() + topo.settings.close_timeout;
        for idx in plan.remove {
            let now = Instant::now();
            if now >= deadline {
                metrics::record_reconcile(report.added, report.removed);
                tracing::warn!(
                    removed = report.removed,
                    "Close budget exhausted during reconfiguration"
                );
                return Err(NetworkError::Timeout(format!(
                    "reconfiguration exceeded close timeout after removing {} nodes",
                    report.removed
                )));
            }

            let node = topo.nodes.remove(idx);
            topo.unindex(&node);
            if node.close(deadline - now).await == CloseOutcome::Forced {
                report.forced_closes += 1;
            }
            report.removed += 1;
            tracing::info!(node = %node.label(), "Node removed");
        }

        let (min_backoff, max_backoff) = (topo.settings.min_node_backoff, topo.settings.max_node_backoff);
        for entry in plan.add {
            let node = Node::new(
                entry.key,
                entry.endpoint,
                Arc::clone(&self.transport),
                min_backoff,
                max_backoff,
            );
            tracing::info!(node = %node.label(), "Node added");
            topo.index(Arc::new(node));
            report.added += 1;
        }

        metrics::record_reconcile(report.added, report.removed);
        metrics::record_nodes(topo.nodes.len(), topo.healthy.len());
        tracing::info!(
            added = report.added,
            removed = report.removed,
            total = topo.nodes.len(),
            keys = topo.by_key.len(),
            "Network reconfigured"
        );
        Ok(report)
    }
}
