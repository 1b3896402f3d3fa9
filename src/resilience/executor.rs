//! Execute-with-retry state machine.
//!
//! # States
//! ```text
//! PickNode → Call → Success                        (terminal)
//!                 → FatalFailure                   (terminal)
//!                 → RetryableFailure
//!                       → attempts left? Delay → PickNode
//!                       → otherwise      FatalFailure
//! ```
//!
//! # Design Decisions
//! - Cancellation is checked before every attempt and raced (biased) against
//!   every wait, so a firing retry timer never starts a cancelled attempt
//! - One absolute deadline per operation; each attempt is also capped by the
//!   per-call timeout
//! - Health feedback is applied after every attempt, retried or not
//! - After a failed attempt, an all-backed-off pool is waited out, not reported
//! - The call guard is released before feedback, so pool maintenance can drain it

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::health::passive::{self, Feedback};
use crate::network::endpoint::Endpoint;
use crate::network::node::Node;
use crate::network::pool::NodePool;
use crate::network::types::{ExecuteError, NetworkError, NodeKey};
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::retries::{classify, RetryPolicy};
use crate::resilience::timeouts::Deadline;
use crate::transport::{Transport, TransportError};

/// How an operation chooses its nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<K> {
    /// A random healthy node per attempt.
    Random,
    /// Nodes of distinct keys, chosen once and rotated through.
    /// `None` uses the pool's default fan-out size.
    FanOut(Option<usize>),
    /// The given keys, rotated through.
    Keys(Vec<K>),
}

/// Everything a work unit gets for one attempt.
pub struct CallContext<K, C> {
    pub node_key: K,
    pub endpoint: Endpoint,
    pub connection: Arc<C>,
    /// 1-based.
    pub attempt: u32,
    /// Keys of a fan-out plan, empty for random selection.
    pub fan_out: Arc<[K]>,
}

enum State<K, T: Transport> {
    PickNode,
    Call(Arc<Node<K, T>>),
    Delay(Duration),
}

enum AttemptFailure {
    Cancelled,
    DeadlineElapsed,
    Transport { error: TransportError, connect: bool },
}

/// Nodes fixed at the start of a fan-out or pinned-key operation.
pub(crate) struct PinnedNodes<K, T: Transport> {
    nodes: Vec<Arc<Node<K, T>>>,
    cursor: usize,
}

impl<K: NodeKey, T: Transport> PinnedNodes<K, T> {
    pub(crate) fn new(nodes: Vec<Arc<Node<K, T>>>) -> Self {
        Self { nodes, cursor: 0 }
    }

    pub(crate) fn keys(&self) -> Arc<[K]> {
        self.nodes.iter().map(|n| n.key().clone()).collect()
    }

    /// Next healthy node in rotation. When all of them are backing off,
    /// waits out the shortest remaining backoff instead.
    pub(crate) async fn next(
        &mut self,
        deadline: &Deadline,
        cancel: &CancellationToken,
    ) -> Result<Arc<Node<K, T>>, NetworkError> {
        let now = Instant::now();
        let len = self.nodes.len();

        for i in 0..len {
            let idx = (self.cursor + i) % len;
            let node = &self.nodes[idx];
            if !node.is_closed() && node.is_healthy(now) {
                self.cursor = (idx + 1) % len;
                return Ok(Arc::clone(node));
            }
        }

        let (idx, node) = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.is_closed())
            .min_by_key(|(_, n)| n.remaining_backoff(now))
            .ok_or(NetworkError::NoHealthyNode)?;
        let node = Arc::clone(node);
        let wait = node.remaining_backoff(now);

        tracing::debug!(
            node = %node.label(),
            wait_ms = wait.as_millis() as u64,
            "All selected nodes backing off, waiting for the nearest"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
            _ = tokio::time::sleep_until(deadline.cap(wait)) => {}
        }
        if deadline.is_expired() {
            return Err(NetworkError::Timeout("deadline passed waiting for a node".into()));
        }

        self.cursor = (idx + 1) % len;
        Ok(node)
    }
}

/// Random healthy node. When every node is backing off, waits for the one
/// closest to readmission, bounded by `deadline` and `cancel`.
pub(crate) async fn wait_for_random_node<K: NodeKey, T: Transport>(
    pool: &NodePool<K, T>,
    deadline: &Deadline,
    cancel: &CancellationToken,
) -> Result<Arc<Node<K, T>>, NetworkError> {
    loop {
        let (node, wait) = pool.pick_random_or_nearest().await?;
        if wait.is_zero() {
            return Ok(node);
        }

        tracing::debug!(
            node = %node.label(),
            wait_ms = wait.as_millis() as u64,
            "No healthy node, waiting for the nearest"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
            _ = tokio::time::sleep_until(deadline.cap(wait)) => {}
        }
        if deadline.is_expired() {
            return Err(NetworkError::Timeout("deadline passed waiting for a node".into()));
        }
        // Removed by a reconcile while we waited.
        if !node.is_closed() {
            return Ok(node);
        }
    }
}

/// Runs work units against the pool with retries.
pub struct RetryExecutor<K, T: Transport> {
    pool: Arc<NodePool<K, T>>,
    policy: RetryPolicy,
}

impl<K, T: Transport> Clone for RetryExecutor<K, T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            policy: self.policy.clone(),
        }
    }
}

impl<K: NodeKey, T: Transport> RetryExecutor<K, T> {
    pub fn new(pool: Arc<NodePool<K, T>>, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &Arc<NodePool<K, T>> {
        &self.pool
    }

    pub async fn execute<F, Fut, R>(&self, selection: Selection<K>, work: F) -> Result<R, ExecuteError>
    where
        F: FnMut(CallContext<K, T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        self.execute_with_cancel(selection, &CancellationToken::new(), work)
            .await
    }

    /// Like `execute`, stopping as soon as `cancel` fires.
    pub async fn execute_with_cancel<F, Fut, R>(
        &self,
        selection: Selection<K>,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<R, ExecuteError>
    where
        F: FnMut(CallContext<K, T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let span = tracing::info_span!("execute", operation_id = %Uuid::new_v4());
        self.run(selection, cancel, work).instrument(span).await
    }

    /// Synchronous variant: the calling thread blocks on `handle` until the
    /// operation finishes. Must not be called from inside the runtime.
    pub fn execute_blocking<F, Fut, R>(
        &self,
        handle: &Handle,
        selection: Selection<K>,
        work: F,
    ) -> Result<R, ExecuteError>
    where
        F: FnMut(CallContext<K, T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        handle.block_on(self.execute(selection, work))
    }

    async fn run<F, Fut, R>(
        &self,
        selection: Selection<K>,
        cancel: &CancellationToken,
        mut work: F,
    ) -> Result<R, ExecuteError>
    where
        F: FnMut(CallContext<K, T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let deadline = Deadline::after(self.policy.request_timeout());
        let mut attempts: u32 = 0;
        let mut last_node: Option<String> = None;
        let fail = |kind: NetworkError, attempts: u32, last_node: &Option<String>| {
            ExecuteError::new(kind, attempts, last_node.clone())
        };

        let mut pinned = match self.pin(selection).await {
            Ok(pinned) => pinned,
            Err(kind) => return Err(fail(kind, 0, &None)),
        };
        let fan_out: Arc<[K]> = pinned.as_ref().map_or_else(|| Arc::from(Vec::new()), |p| p.keys());

        let mut state: State<K, T> = State::PickNode;
        loop {
            state = match state {
                State::PickNode => {
                    if cancel.is_cancelled() {
                        return Err(fail(NetworkError::Cancelled, attempts, &last_node));
                    }
                    if deadline.is_expired() {
                        return Err(fail(
                            NetworkError::Timeout("request deadline exceeded".into()),
                            attempts,
                            &last_node,
                        ));
                    }
                    let picked = match pinned.as_mut() {
                        Some(pinned) => pinned.next(&deadline, cancel).await,
                        // Only the first pick fails fast on an all-backed-off pool.
                        None if attempts == 0 => self.pool.pick_random_healthy_node().await,
                        None => wait_for_random_node(&self.pool, &deadline, cancel).await,
                    };
                    match picked {
                        Ok(node) => State::Call(node),
                        Err(kind) => return Err(fail(kind, attempts, &last_node)),
                    }
                }

                State::Call(node) => {
                    attempts += 1;
                    last_node = Some(node.label());
                    tracing::debug!(node = %node.label(), attempt = attempts, "Attempt starting");

                    let outcome =
                        Self::attempt(&node, attempts, &fan_out, &deadline, cancel, &self.policy, &mut work)
                            .await;
                    match outcome {
                        Ok(response) => {
                            passive::record(&self.pool, &node, Feedback::Success).await;
                            return Ok(response);
                        }
                        Err(AttemptFailure::Cancelled) => {
                            return Err(fail(NetworkError::Cancelled, attempts, &last_node));
                        }
                        Err(AttemptFailure::DeadlineElapsed) => {
                            return Err(fail(
                                NetworkError::Timeout("request deadline exceeded during call".into()),
                                attempts,
                                &last_node,
                            ));
                        }
                        Err(AttemptFailure::Transport { error, connect }) => {
                            let classified = if connect {
                                NetworkError::Transient(error)
                            } else {
                                classify(error)
                            };
                            let error = match classified {
                                NetworkError::Transient(error) => error,
                                fatal => {
                                    passive::record(&self.pool, &node, Feedback::FatalFailure).await;
                                    tracing::debug!(node = %node.label(), error = %fatal, "Fatal failure");
                                    return Err(fail(fatal, attempts, &last_node));
                                }
                            };

                            passive::record(&self.pool, &node, Feedback::RetryableFailure).await;
                            if attempts >= self.policy.max_attempts() {
                                tracing::warn!(
                                    node = %node.label(),
                                    attempts,
                                    error = %error,
                                    "Giving up, attempts exhausted"
                                );
                                return Err(fail(
                                    NetworkError::MaxAttemptsExceeded(error),
                                    attempts,
                                    &last_node,
                                ));
                            }

                            let delay = calculate_backoff(
                                attempts,
                                self.policy.min_backoff(),
                                self.policy.max_backoff(),
                            );
                            tracing::warn!(
                                node = %node.label(),
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "Retryable failure, retrying"
                            );
                            State::Delay(delay)
                        }
                    }
                }

                State::Delay(delay) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(fail(NetworkError::Cancelled, attempts, &last_node));
                        }
                        _ = tokio::time::sleep_until(deadline.cap(delay)) => {}
                    }
                    State::PickNode
                }
            };
        }
    }

    async fn pin(&self, selection: Selection<K>) -> Result<Option<PinnedNodes<K, T>>, NetworkError> {
        let nodes = match selection {
            Selection::Random => return Ok(None),
            Selection::FanOut(count) => {
                let count = match count {
                    Some(count) => count,
                    None => self.pool.default_fan_out().await,
                };
                self.pool.pick_most_healthy_nodes(count).await?
            }
            Selection::Keys(keys) => {
                let mut nodes = Vec::with_capacity(keys.len());
                for key in &keys {
                    nodes.push(self.pool.node_for_key(key).await?);
                }
                nodes
            }
        };
        if nodes.is_empty() {
            return Err(NetworkError::NoHealthyNode);
        }
        Ok(Some(PinnedNodes::new(nodes)))
    }

    async fn attempt<F, Fut, R>(
        node: &Arc<Node<K, T>>,
        attempt: u32,
        fan_out: &Arc<[K]>,
        deadline: &Deadline,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
        work: &mut F,
    ) -> Result<R, AttemptFailure>
    where
        F: FnMut(CallContext<K, T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let call_deadline = match policy.call_timeout() {
            Some(timeout) => deadline.cap(timeout),
            None => deadline.instant(),
        };

        let call = async {
            let connection = node
                .get_connection()
                .await
                .map_err(|error| AttemptFailure::Transport { error, connect: true })?;
            let _guard = node.begin_call();
            let ctx = CallContext {
                node_key: node.key().clone(),
                endpoint: node.endpoint().clone(),
                connection,
                attempt,
                fan_out: Arc::clone(fan_out),
            };
            work(ctx)
                .await
                .map_err(|error| AttemptFailure::Transport { error, connect: false })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptFailure::Cancelled),
            result = tokio::time::timeout_at(call_deadline, call) => match result {
                Ok(outcome) => outcome,
                Err(_) if deadline.is_expired() => Err(AttemptFailure::DeadlineElapsed),
                Err(_) => Err(AttemptFailure::Transport {
                    error: TransportError::deadline_exceeded(format!(
                        "call to {} exceeded its deadline",
                        node.label()
                    )),
                    connect: false,
                }),
            },
        }
    }
}
