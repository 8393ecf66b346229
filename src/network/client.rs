//! Network Client
//!
//! TCP client for request/response exchanges with peer acceptors. Each peer
//! address owns one connection slot; concurrent callers share the slot, so
//! at most one connection is dialed per address and exchanges on it are
//! serialised, keeping requests paired with their responses. A stream is
//! only returned to the slot after a completed exchange, so a request
//! abandoned mid-flight can never leak its late response to a later caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{recv_message, send_message};
use crate::error::{Error, Result};
use crate::protocol::Message;

type ConnectionSlot = Arc<Mutex<Option<TcpStream>>>;

/// Network client for request/response exchanges with peer nodes
pub struct NetworkClient {
    /// Connection slot per peer address
    pool: RwLock<HashMap<String, ConnectionSlot>>,
    /// Connection timeout
    connect_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Send a request to a peer and wait for the response, bounded by
    /// `request_timeout`.
    pub async fn request(
        &self,
        address: &str,
        message: Message,
        request_timeout: Duration,
    ) -> Result<Message> {
        match timeout(request_timeout, self.request_inner(address, message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn request_inner(&self, address: &str, message: Message) -> Result<Message> {
        let slot = self.slot(address).await;
        let mut slot = slot.lock().await;

        let pooled = slot.take();
        let fresh = pooled.is_none();
        let mut stream = match pooled {
            Some(stream) => stream,
            None => self.connect(address).await?,
        };

        match exchange(&mut stream, &message).await {
            Ok(response) => {
                *slot = Some(stream);
                Ok(response)
            }
            // A connection that fails on its very first exchange is reported
            // as-is; a pooled one may simply have been closed by the peer
            // since its last use, so retry once on a fresh stream.
            Err(e) if fresh => Err(e),
            Err(e) => {
                tracing::debug!(address, error = %e, "pooled connection went stale, redialing");
                let mut stream = self.connect(address).await?;
                let response = exchange(&mut stream, &message).await?;
                *slot = Some(stream);
                Ok(response)
            }
        }
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Get or create the connection slot for an address. The slot is
    /// inserted empty; whoever holds its lock first dials the connection.
    async fn slot(&self, address: &str) -> ConnectionSlot {
        if let Some(slot) = self.pool.read().await.get(address) {
            return Arc::clone(slot);
        }
        let mut pool = self.pool.write().await;
        Arc::clone(pool.entry(address.to_string()).or_default())
    }

    /// Close all connections
    pub async fn close_all(&self) {
        let mut pool = self.pool.write().await;
        pool.clear();
    }

    /// Number of open pooled connections
    pub async fn connection_count(&self) -> usize {
        let pool = self.pool.read().await;
        let mut count = 0;
        for slot in pool.values() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}

/// Write a request and read the paired response
async fn exchange(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    send_message(stream, message).await?;
    recv_message(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_creation() {
        let client = NetworkClient::new(Duration::from_secs(5));
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let client = NetworkClient::new(Duration::from_millis(100));

        // Should fail to connect to a non-routable port
        let result = client
            .request(
                "127.0.0.1:1",
                Message::GetReplicationEndpointInfo,
                Duration::from_millis(500),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        // Echo acceptor counting distinct inbound connections.
        let connections = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    while let Ok(message) = recv_message(&mut socket).await {
                        if send_message(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let client = Arc::new(NetworkClient::new(Duration::from_secs(1)));
        let mut requests = Vec::new();
        for _ in 0..4 {
            let client = Arc::clone(&client);
            let address = address.clone();
            requests.push(tokio::spawn(async move {
                client
                    .request(
                        &address,
                        Message::GetReplicationEndpointInfo,
                        Duration::from_secs(1),
                    )
                    .await
            }));
        }
        for request in requests {
            assert!(request.await.unwrap().is_ok());
        }

        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(client.connection_count().await, 1);
    }
}
