//! Resilient server-streaming subscriptions.
//!
//! # Data Flow
//! ```text
//! subscribe()
//!     → spawned task: pick node → open stream via factory
//!     → parts → chunks.rs → SubscriptionEvent::Message
//!     → stream error: classify (retryable_for_stream), back off, reopen
//!     → Completed | Failed  (exactly one terminal event)
//! ```
//!
//! # Design Decisions
//! - A mid-stream failure is a failed attempt: cancel, back off, reopen on a fresh node
//! - With every node backing off, the reconnect waits for the nearest one
//! - The factory sees how many messages were delivered so far, so it can resume
//! - Reassembly state survives reconnects, so replayed parts are not re-emitted
//! - Cancellation is raced (biased) against every wait and every stream read

use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::passive::{self, Feedback};
use crate::network::endpoint::Endpoint;
use crate::network::pool::NodePool;
use crate::network::types::{ExecuteError, NetworkError, NodeKey};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::executor::wait_for_random_node;
use crate::resilience::retries::{classify_for_stream, RetryPolicy};
use crate::resilience::timeouts::Deadline;
use crate::streaming::chunks::{ChunkAssembler, Message, StreamPart};
use crate::transport::{Transport, TransportError};

static SUBSCRIPTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Stream of parts returned by a subscription factory.
pub type PartStream<P> = BoxStream<'static, Result<StreamPart<P>, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(SUBSCRIPTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What the factory gets to open one stream.
pub struct SubscribeContext<K, C> {
    pub node_key: K,
    pub endpoint: Endpoint,
    pub connection: Arc<C>,
    /// 1-based.
    pub attempt: u32,
    /// Messages delivered before this attempt.
    pub delivered: u64,
}

#[derive(Debug)]
pub enum SubscriptionEvent<P> {
    Message(Message<P>),
    /// The server ended the stream.
    Completed,
    Failed(ExecuteError),
}

/// Handle to a running subscription. Dropping it does not stop the task.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to deliver its terminal event.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(subscription = %self.id, error = %e, "Subscription task failed");
        }
    }
}

/// Live subscriptions and their cancellation tokens.
///
/// Entries are added before a task starts and removed by the task itself
/// once its terminal event is sent.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    live: DashMap<SubscriptionId, CancellationToken>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.live.contains_key(&id)
    }

    /// Cancel every live subscription. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.live.iter() {
            entry.value().cancel();
            count += 1;
        }
        count
    }

    fn insert(&self, id: SubscriptionId, cancel: CancellationToken) {
        self.live.insert(id, cancel);
    }

    fn remove(&self, id: SubscriptionId) {
        self.live.remove(&id);
    }
}

/// Start a subscription on `handle`. Events arrive on the returned receiver.
///
/// `cancel` is observed by the task; cancelling it (or the handle) ends the
/// subscription with `Failed(Cancelled)`.
pub fn subscribe<K, T, P, F, Fut>(
    pool: Arc<NodePool<K, T>>,
    policy: RetryPolicy,
    handle: &Handle,
    cancel: CancellationToken,
    factory: F,
) -> (SubscriptionHandle, mpsc::UnboundedReceiver<SubscriptionEvent<P>>)
where
    K: NodeKey,
    T: Transport,
    P: Send + 'static,
    F: FnMut(SubscribeContext<K, T::Connection>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<PartStream<P>, TransportError>> + Send + 'static,
{
    let id = SubscriptionId::next();
    let (tx, rx) = mpsc::unbounded_channel();

    let task = handle.spawn(run(id, pool, policy, cancel.clone(), factory, tx));
    (SubscriptionHandle { id, cancel, task }, rx)
}

/// Like `subscribe`, keeping the subscription in `registry` while it runs.
pub fn subscribe_tracked<K, T, P, F, Fut>(
    pool: Arc<NodePool<K, T>>,
    policy: RetryPolicy,
    handle: &Handle,
    registry: Arc<SubscriptionRegistry>,
    cancel: CancellationToken,
    factory: F,
) -> (SubscriptionHandle, mpsc::UnboundedReceiver<SubscriptionEvent<P>>)
where
    K: NodeKey,
    T: Transport,
    P: Send + 'static,
    F: FnMut(SubscribeContext<K, T::Connection>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<PartStream<P>, TransportError>> + Send + 'static,
{
    let id = SubscriptionId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    registry.insert(id, cancel.clone());

    let task = handle.spawn({
        let cancel = cancel.clone();
        async move {
            run(id, pool, policy, cancel, factory, tx).await;
            registry.remove(id);
        }
    });
    (SubscriptionHandle { id, cancel, task }, rx)
}

enum StreamEnd {
    Completed,
    Cancelled,
    ReceiverGone,
    Failed { error: TransportError, connect: bool },
}

async fn run<K, T, P, F, Fut>(
    id: SubscriptionId,
    pool: Arc<NodePool<K, T>>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    mut factory: F,
    tx: mpsc::UnboundedSender<SubscriptionEvent<P>>,
) where
    K: NodeKey,
    T: Transport,
    P: Send + 'static,
    F: FnMut(SubscribeContext<K, T::Connection>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<PartStream<P>, TransportError>> + Send + 'static,
{
    let mut assembler = ChunkAssembler::new();
    let mut attempts: u32 = 0;
    let mut delivered: u64 = 0;
    let mut last_node: Option<String> = None;
    // Streams have no overall deadline, only the attempt budget.
    let unbounded = Deadline::after(Duration::MAX);

    let terminal = loop {
        if cancel.is_cancelled() {
            break Some(ExecuteError::new(NetworkError::Cancelled, attempts, last_node));
        }
        let picked = if attempts == 0 {
            pool.pick_random_healthy_node().await
        } else {
            wait_for_random_node(&pool, &unbounded, &cancel).await
        };
        let node = match picked {
            Ok(node) => node,
            Err(kind) => break Some(ExecuteError::new(kind, attempts, last_node)),
        };
        attempts += 1;
        last_node = Some(node.label());

        let end = async {
            let connection = match node.get_connection().await {
                Ok(connection) => connection,
                Err(error) => return StreamEnd::Failed { error, connect: true },
            };
            let _guard = node.begin_call();
            let ctx = SubscribeContext {
                node_key: node.key().clone(),
                endpoint: node.endpoint().clone(),
                connection,
                attempt: attempts,
                delivered,
            };
            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                opened = factory(ctx) => match opened {
                    Ok(stream) => stream,
                    Err(error) => return StreamEnd::Failed { error, connect: false },
                },
            };
            tracing::debug!(subscription = %id, node = %node.label(), attempt = attempts, "Stream opened");

            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return StreamEnd::Cancelled,
                    item = stream.next() => item,
                };
                match item {
                    None => return StreamEnd::Completed,
                    Some(Err(error)) => return StreamEnd::Failed { error, connect: false },
                    Some(Ok(part)) => {
                        if let Some(message) = assembler.push(part) {
                            delivered += 1;
                            if tx.send(SubscriptionEvent::Message(message)).is_err() {
                                return StreamEnd::ReceiverGone;
                            }
                        }
                    }
                }
            }
        }
        .await;

        match end {
            StreamEnd::Completed => {
                passive::record(&pool, &node, Feedback::Success).await;
                tracing::info!(subscription = %id, delivered, "Subscription completed");
                let _ = tx.send(SubscriptionEvent::Completed);
                break None;
            }
            StreamEnd::Cancelled => {
                break Some(ExecuteError::new(NetworkError::Cancelled, attempts, last_node));
            }
            StreamEnd::ReceiverGone => {
                tracing::debug!(subscription = %id, "Receiver dropped, ending subscription");
                break None;
            }
            StreamEnd::Failed { error, connect } => {
                let classified = if connect {
                    NetworkError::Transient(error)
                } else {
                    classify_for_stream(error)
                };
                let error = match classified {
                    NetworkError::Transient(error) => error,
                    fatal => {
                        passive::record(&pool, &node, Feedback::FatalFailure).await;
                        break Some(ExecuteError::new(fatal, attempts, last_node));
                    }
                };
                passive::record(&pool, &node, Feedback::RetryableFailure).await;
                if attempts >= policy.max_attempts() {
                    break Some(ExecuteError::new(
                        NetworkError::MaxAttemptsExceeded(error),
                        attempts,
                        last_node,
                    ));
                }

                let delay = calculate_backoff(attempts, policy.min_backoff(), policy.max_backoff());
                tracing::warn!(
                    subscription = %id,
                    node = %node.label(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Stream failed, reconnecting"
                );
                metrics::record_subscription_reconnect();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        break Some(ExecuteError::new(NetworkError::Cancelled, attempts, last_node));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };

    if let Some(error) = terminal {
        tracing::warn!(subscription = %id, error = %error, "Subscription ended with error");
        let _ = tx.send(SubscriptionEvent::Failed(error));
    }
}
