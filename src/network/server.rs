//! Network Server
//!
//! TCP server accepting request/response connections from peer endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{recv_message, send_message};
use crate::error::{Error, Result};
use crate::protocol::Message;

/// Asynchronous request handler plugged into the server
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request; `Some` replies to the peer, `None` stays silent
    async fn handle(&self, peer: &str, message: Message) -> Option<Message>;
}

/// Network server for endpoint communication
pub struct NetworkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl NetworkServer {
    /// Bind the server to an address
    pub async fn bind(bind_address: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The address the server actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start serving in a background task
    pub fn spawn(self, handler: Arc<dyn RequestHandler>) -> NetworkServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let task = tokio::spawn(serve(self.listener, handler, shutdown_rx));

        NetworkServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running network server
pub struct NetworkServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl NetworkServerHandle {
    /// The address the server bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Waits until the listener is released so
    /// the address can be rebound immediately.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let peer_addr = addr.to_string();
                        let handler = Arc::clone(&handler);

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, peer_addr.clone(), handler).await {
                                tracing::warn!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Network server stopped");
}

/// Handle a single connection
async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: String,
    handler: Arc<dyn RequestHandler>,
) -> Result<()> {
    loop {
        match recv_message(&mut socket).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                if let Some(response) = handler.handle(&peer_addr, message).await {
                    send_message(&mut socket, &response).await?;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}
