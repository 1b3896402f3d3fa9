//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use node_network::config::{NetworkConfig, NodeConfig};
use node_network::network::{Endpoint, NetworkEntry, PoolSettings};
use node_network::transport::{Connection, Transport, TransportError};

/// Flags observed on one mock connection.
#[derive(Debug, Default)]
pub struct ConnState {
    pub shut_down: AtomicBool,
    pub aborted: AtomicBool,
}

pub struct MockConnection {
    pub endpoint: Endpoint,
    pub state: Arc<ConnState>,
    shutdown_delay: Duration,
}

#[async_trait]
impl Connection for MockConnection {
    async fn shutdown(&self) {
        if !self.shutdown_delay.is_zero() {
            tokio::time::sleep(self.shutdown_delay).await;
        }
        self.state.shut_down.store(true, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.state.aborted.store(true, Ordering::SeqCst);
    }
}

/// Transport whose connect outcome is scripted per host.
#[derive(Default)]
pub struct MockTransport {
    refused: Mutex<HashSet<String>>,
    connects: AtomicUsize,
    shutdown_delay: Mutex<Duration>,
    opened: Mutex<Vec<(Endpoint, Arc<ConnState>)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connections to `host` fail with `unavailable` from now on.
    pub fn refuse(&self, host: &str) {
        self.refused.lock().unwrap().insert(host.to_string());
    }

    pub fn accept(&self, host: &str) {
        self.refused.lock().unwrap().remove(host);
    }

    /// Make every later connection take `delay` to shut down.
    pub fn set_shutdown_delay(&self, delay: Duration) {
        *self.shutdown_delay.lock().unwrap() = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// State of every connection ever opened to `host`.
    pub fn connections_to(&self, host: &str) -> Vec<Arc<ConnState>> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e.host() == host)
            .map(|(_, s)| Arc::clone(s))
            .collect()
    }

    pub fn opened_endpoints(&self) -> Vec<Endpoint> {
        self.opened.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MockConnection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().unwrap().contains(endpoint.host()) {
            return Err(TransportError::unavailable(format!("{} refused", endpoint)));
        }
        let state = Arc::new(ConnState::default());
        self.opened
            .lock()
            .unwrap()
            .push((endpoint.clone(), Arc::clone(&state)));
        Ok(MockConnection {
            endpoint: endpoint.clone(),
            state,
            shutdown_delay: *self.shutdown_delay.lock().unwrap(),
        })
    }
}

pub fn entry(key: &str, address: &str) -> NetworkEntry<String> {
    NetworkEntry::new(key.to_string(), Endpoint::parse(address).unwrap())
}

pub fn entries(pairs: &[(&str, &str)]) -> Vec<NetworkEntry<String>> {
    pairs.iter().map(|(k, a)| entry(k, a)).collect()
}

pub fn config(pairs: &[(&str, &str)]) -> NetworkConfig {
    NetworkConfig {
        nodes: pairs
            .iter()
            .map(|(key, address)| NodeConfig {
                key: key.to_string(),
                address: address.to_string(),
            })
            .collect(),
        ..NetworkConfig::default()
    }
}

/// Pool settings with short close budget, eviction off.
pub fn settings() -> PoolSettings {
    PoolSettings {
        close_timeout: Duration::from_secs(5),
        ..PoolSettings::default()
    }
}

/// Start a TCP backend that accepts connections and holds them open.
pub async fn start_mock_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match listener.accept().await {
                Ok((socket, _)) => held.push(socket),
                Err(_) => break,
            }
        }
    });
    addr
}
