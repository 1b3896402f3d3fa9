//! Client facade.
//!
//! # Data Flow
//! ```text
//! ClientBuilder (transport, config, seed, runtime handle)
//!     → validate config → NodePool + first reconcile
//!     → Client
//!
//! Client::execute / execute_blocking → RetryExecutor (current retry policy)
//! Client::subscribe                 → streaming::subscribe_tracked
//! Client::apply_config              → pool settings → transport security → reconcile
//!                                   → swap published config and policies
//! Client::close                     → cancel all work → NodePool::close
//! ```
//!
//! # Design Decisions
//! - Keys are strings as they appear in the config file
//! - Policies are swapped atomically; operations already running keep the
//!   policy they started with
//! - Config applications are serialized so two reloads never interleave
//! - Every execute and subscription observes the client's shutdown token

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::loader::ConfigError;
use crate::config::schema::NetworkConfig;
use crate::config::validation::validate_config;
use crate::network::pool::{NodePool, PoolSnapshot};
use crate::network::random::RandomSelector;
use crate::network::reconcile::ReconcileReport;
use crate::network::types::{ExecuteError, NetworkError};
use crate::resilience::executor::{CallContext, RetryExecutor, Selection};
use crate::resilience::retries::RetryPolicy;
use crate::streaming::subscription::{
    subscribe_tracked, PartStream, SubscribeContext, SubscriptionEvent, SubscriptionHandle,
    SubscriptionRegistry,
};
use crate::transport::{Transport, TransportError};

/// Errors from building or reconfiguring a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("no tokio runtime available")]
    NoRuntime,
}

pub struct ClientBuilder<T> {
    transport: Arc<T>,
    config: NetworkConfig,
    seed: Option<u64>,
    runtime: Option<Handle>,
}

impl<T: Transport> ClientBuilder<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            config: NetworkConfig::default(),
            seed: None,
            runtime: None,
        }
    }

    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed node selection for reproducible runs.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Runtime used for subscriptions and blocking calls. Defaults to the current one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub async fn build(self) -> Result<Client<T>, ClientError> {
        validate_config(&self.config).map_err(ConfigError::Validation)?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ClientError::NoRuntime)?,
        };
        let selector = match self.seed {
            Some(seed) => RandomSelector::from_seed(seed),
            None => RandomSelector::from_entropy(),
        };

        let retry_policy = self.config.retry_policy()?;
        let subscription_policy = self.config.subscription_policy()?;
        let pool = Arc::new(NodePool::with_selector(
            self.transport,
            self.config.pool_settings(),
            selector,
        ));
        let report = pool.reconcile(self.config.entries()?).await?;
        tracing::info!(nodes = report.added, "Client started");

        Ok(Client {
            pool,
            config: ArcSwap::from_pointee(self.config),
            retry_policy: ArcSwap::from_pointee(retry_policy),
            subscription_policy: ArcSwap::from_pointee(subscription_policy),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            shutdown: CancellationToken::new(),
            runtime,
            apply_lock: Mutex::new(()),
        })
    }
}

/// Entry point for callers: one pool, its policies and its live subscriptions.
pub struct Client<T: Transport> {
    pool: Arc<NodePool<String, T>>,
    config: ArcSwap<NetworkConfig>,
    retry_policy: ArcSwap<RetryPolicy>,
    subscription_policy: ArcSwap<RetryPolicy>,
    subscriptions: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
    runtime: Handle,
    apply_lock: Mutex<()>,
}

impl<T: Transport> Client<T> {
    pub fn builder(transport: Arc<T>) -> ClientBuilder<T> {
        ClientBuilder::new(transport)
    }

    pub fn pool(&self) -> &Arc<NodePool<String, T>> {
        &self.pool
    }

    /// Config currently in effect.
    pub fn config(&self) -> Arc<NetworkConfig> {
        self.config.load_full()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.load().as_ref().clone()
    }

    fn executor(&self) -> RetryExecutor<String, T> {
        RetryExecutor::new(Arc::clone(&self.pool), self.retry_policy())
    }

    // --- Calls ---

    pub async fn execute<F, Fut, R>(&self, selection: Selection<String>, work: F) -> Result<R, ExecuteError>
    where
        F: FnMut(CallContext<String, T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        self.executor()
            .execute_with_cancel(selection, &self.shutdown, work)
            .await
    }

    /// Like `execute`, also stopping when `cancel` fires.
    pub async fn execute_with_cancel<F, Fut, R>(
        &self,
        selection: Selection<String>,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<R, ExecuteError>
    where
        F: FnMut(CallContext<String, T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let linked = self.shutdown.child_token();
        let executor = self.executor();
        let call = executor.execute_with_cancel(selection, &linked, work);
        tokio::pin!(call);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                linked.cancel();
                call.await
            }
            result = &mut call => result,
        }
    }

    /// Blocks the calling thread. Must not be called from inside the runtime.
    pub fn execute_blocking<F, Fut, R>(&self, selection: Selection<String>, work: F) -> Result<R, ExecuteError>
    where
        F: FnMut(CallContext<String, T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        self.runtime.block_on(self.execute(selection, work))
    }

    /// Start a resilient subscription. It ends on its own, when cancelled
    /// through the handle, or when the client closes.
    pub fn subscribe<P, F, Fut>(
        &self,
        factory: F,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<SubscriptionEvent<P>>)
    where
        P: Send + 'static,
        F: FnMut(SubscribeContext<String, T::Connection>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<PartStream<P>, TransportError>> + Send + 'static,
    {
        let policy = self.subscription_policy.load().as_ref().clone();
        subscribe_tracked(
            Arc::clone(&self.pool),
            policy,
            &self.runtime,
            Arc::clone(&self.subscriptions),
            self.shutdown.child_token(),
            factory,
        )
    }

    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    // --- Reconfiguration ---

    /// Validate and apply a new config, then publish it.
    ///
    /// On error the published config is left unchanged, though pool
    /// settings applied before the failing step stay in effect.
    pub async fn apply_config(&self, config: NetworkConfig) -> Result<ReconcileReport, ClientError> {
        let _serial = self.apply_lock.lock().await;
        validate_config(&config).map_err(ConfigError::Validation)?;
        let retry_policy = config.retry_policy()?;
        let subscription_policy = config.subscription_policy()?;
        let entries = config.entries()?;

        let current = self.pool.settings().await;
        let next = config.pool_settings();
        if (current.min_node_backoff, current.max_node_backoff)
            != (next.min_node_backoff, next.max_node_backoff)
        {
            self.pool
                .set_node_backoff(next.min_node_backoff, next.max_node_backoff)
                .await?;
        }
        if (current.min_readmit, current.max_readmit) != (next.min_readmit, next.max_readmit) {
            self.pool.set_readmit_bounds(next.min_readmit, next.max_readmit).await?;
        }
        self.pool.set_max_node_attempts(next.max_node_attempts).await?;
        self.pool.set_close_timeout(next.close_timeout).await?;
        self.pool.set_max_nodes_per_request(next.max_nodes_per_request).await?;
        if current.transport_security != next.transport_security {
            self.pool.set_transport_security(next.transport_security).await?;
        }

        let report = self.pool.reconcile(entries).await?;

        self.retry_policy.store(Arc::new(retry_policy));
        self.subscription_policy.store(Arc::new(subscription_policy));
        self.config.store(Arc::new(config));
        tracing::info!(
            added = report.added,
            removed = report.removed,
            forced_closes = report.forced_closes,
            "Configuration applied"
        );
        Ok(report)
    }

    /// Apply every config received on `updates` until the channel closes
    /// or the client shuts down.
    pub fn spawn_config_updates(self: &Arc<Self>, mut updates: mpsc::UnboundedReceiver<NetworkConfig>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        self.runtime.spawn(async move {
            loop {
                let config = tokio::select! {
                    biased;
                    _ = client.shutdown.cancelled() => break,
                    next = updates.recv() => match next {
                        Some(config) => config,
                        None => break,
                    },
                };
                if let Err(e) = client.apply_config(config).await {
                    tracing::error!(error = %e, "Failed to apply configuration update");
                }
            }
            tracing::debug!("Config update loop stopped");
        })
    }

    // --- Views ---

    /// Address → key map of the current network.
    pub async fn network(&self) -> HashMap<String, String> {
        self.pool.network().await
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot().await
    }

    // --- Lifecycle ---

    /// Cancel every running operation and subscription, then close the pool.
    /// Later calls return `Ok`.
    pub async fn close(&self) -> Result<(), NetworkError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        let cancelled = self.subscriptions.cancel_all();
        tracing::info!(subscriptions = cancelled, "Client closing");
        self.pool.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
