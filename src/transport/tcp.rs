//! Plain TCP transport.
//!
//! Used by the CLI to probe reachability of every configured endpoint.
//! Only checks that a socket can be opened and is still alive; TLS is not
//! negotiated even for secure endpoints.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

use crate::network::endpoint::Endpoint;
use crate::transport::{Code, Connection, Transport, TransportError};

/// Transport opening one TCP stream per node.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpConnection, TransportError> {
        let authority = endpoint.authority();
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&authority)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(map_io_error(&e)),
            Err(_) => {
                return Err(TransportError::unavailable(format!(
                    "connect to {} timed out after {:?}",
                    authority, self.connect_timeout
                )))
            }
        };
        let peer = stream.peer_addr().map_err(|e| map_io_error(&e))?;

        tracing::debug!(endpoint = %endpoint, peer = %peer, "TCP connection established");
        Ok(TcpConnection {
            peer,
            stream: Mutex::new(Some(stream)),
        })
    }
}

/// One open TCP stream.
#[derive(Debug)]
pub struct TcpConnection {
    peer: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Check the stream is still open. Returns how long the check took.
    pub async fn ping(&self) -> Result<Duration, TransportError> {
        let guard = self.stream.lock().await;
        let Some(stream) = guard.as_ref() else {
            return Err(TransportError::unavailable("connection closed"));
        };

        let start = Instant::now();
        stream.writable().await.map_err(|e| map_io_error(&e))?;

        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(0) => Err(TransportError::unavailable(format!(
                "{} closed the connection",
                self.peer
            ))),
            Ok(_) => Ok(start.elapsed()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(start.elapsed()),
            Err(e) => Err(map_io_error(&e)),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn shutdown(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(peer = %self.peer, error = %e, "TCP shutdown failed");
            }
        }
    }

    fn abort(&self) {
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }
    }
}

fn map_io_error(e: &io::Error) -> TransportError {
    let code = match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::TimedOut
        | io::ErrorKind::BrokenPipe => Code::Unavailable,
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => Code::InvalidArgument,
        _ => Code::Unknown,
    };
    TransportError::new(code, e.to_string())
}
